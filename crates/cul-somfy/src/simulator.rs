//! Position estimate for shutters that report nothing back.
//!
//! With known travel times a run is modelled as linear in time: a timer marks
//! the end position, and a STOP in between interpolates from the elapsed time.
//! Without travel times the shutter is treated as binary open/closed.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::publish::CoverState;
use crate::record::DeviceRecord;

/// Assumed position when nothing is stored.
pub const UNKNOWN_POSITION: u8 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    Opening,
    Closing,
    #[default]
    Idle,
}

impl Direction {
    pub fn sign(self) -> i32 {
        match self {
            Direction::Opening => 1,
            Direction::Closing => -1,
            Direction::Idle => 0,
        }
    }

    pub fn moving_state(self) -> CoverState {
        match self {
            Direction::Closing => CoverState::Closing,
            _ => CoverState::Opening,
        }
    }

    fn end(self) -> (CoverState, u8) {
        match self {
            Direction::Closing => (CoverState::Closed, 0),
            _ => (CoverState::Open, 100),
        }
    }
}

/// Transient motion bookkeeping, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Motion {
    pub direction: Direction,
    pub cmd_time: Option<Instant>,
}

impl Motion {
    pub fn started(direction: Direction, at: Instant) -> Self {
        Self { direction, cmd_time: Some(at) }
    }
}

/// What an OPEN or CLOSE does to the published state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Plan {
    /// Publish `moving`, then `end` at `position` once `travel` has elapsed.
    Travel { moving: CoverState, travel: Duration, end: CoverState, position: u8 },
    /// Binary device: publish `end` at `position` right away.
    Arrive { end: CoverState, position: u8 },
}

fn travel_time(secs: Option<f64>) -> Option<Duration> {
    secs.filter(|s| s.is_finite() && *s > 0.0).map(Duration::from_secs_f64)
}

fn travel_for(record: &DeviceRecord, direction: Direction) -> Option<Duration> {
    match direction {
        Direction::Opening => travel_time(record.up_time),
        Direction::Closing => travel_time(record.down_time),
        Direction::Idle => None,
    }
}

pub fn plan(record: &DeviceRecord, direction: Direction) -> Plan {
    let (end, position) = direction.end();
    match travel_for(record, direction) {
        Some(travel) => Plan::Travel { moving: direction.moving_state(), travel, end, position },
        None => Plan::Arrive { end, position },
    }
}

/// Position after a STOP at `now`.
///
/// Only a run whose timer was still armed moves the estimate; otherwise the
/// stored position (or [`UNKNOWN_POSITION`]) is kept.
pub fn stop_position(record: &DeviceRecord, motion: &Motion, timer_was_armed: bool, now: Instant) -> u8 {
    let current = i32::from(record.current_pos.unwrap_or(UNKNOWN_POSITION));
    if !timer_was_armed || motion.direction == Direction::Idle {
        return clamp(current);
    }
    let (Some(started), Some(travel)) = (motion.cmd_time, travel_for(record, motion.direction)) else {
        return clamp(current);
    };
    let elapsed = now.saturating_duration_since(started).as_secs_f64();
    let ratio = (elapsed / travel.as_secs_f64()).min(1.0);
    let delta = (ratio * 100.0) as i32 * motion.direction.sign();
    clamp(current + delta)
}

fn clamp(pos: i32) -> u8 {
    pos.clamp(0, 100) as u8
}

/// State and position announced at start-up.
pub fn initial_state(record: &DeviceRecord) -> (CoverState, u8) {
    match record.current_pos {
        Some(100) => (CoverState::Open, 100),
        Some(0) => (CoverState::Closed, 0),
        Some(pos) => (CoverState::Stopped, pos.min(100)),
        None => (CoverState::Stopped, UNKNOWN_POSITION),
    }
}

/// The single end-of-run timer of one device.
///
/// Every arm/cancel bumps the generation, so an expiry that lost the race
/// against a cancel can tell it is stale.
#[derive(Debug, Default)]
pub struct MotionTimer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl MotionTimer {
    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Cancels the running timer; returns whether one was armed.
    pub fn cancel(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels any previous timer and returns the generation for the next one.
    pub fn next_generation(&mut self) -> u64 {
        self.cancel();
        self.generation
    }

    pub fn arm(&mut self, generation: u64, task: JoinHandle<()>) {
        debug_assert_eq!(generation, self.generation);
        self.task = Some(task);
    }

    /// Called by the expiring task; true if it is still the current timer.
    pub fn fire(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.task = None;
        true
    }
}
