use std::time::Duration;
use tokio::time::Instant;

use crate::command::CoverCommand;

/// Travel-time measurement driven by the normal command vocabulary.
///
/// `CALIBRATE` starts a full downward run; the user sends `STOP` when the
/// shutter reaches the bottom. After a short settle pause the shutter is sent
/// back up, and a second `STOP` at the top ends the measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Calibration {
    #[default]
    Idle,
    MeasuringDown { started: Instant },
    /// Bottom reached, waiting before the upward run is started.
    Settling,
    MeasuringUp { started: Instant },
}

/// What the handler has to do after a calibration transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    /// Send `down`, publish `calibrating`.
    Started,
    /// Publish `stopped`; no frame.
    Cancelled,
    /// Store `down_time`, send `my` and schedule the upward run.
    DownMeasured(Duration),
    /// Store `up_time`, send `my`, publish `open` at 100.
    UpMeasured(Duration),
    /// Command has no meaning during a measurement.
    Ignored(CoverCommand),
}

impl Calibration {
    pub fn is_active(&self) -> bool {
        !matches!(self, Calibration::Idle)
    }

    pub fn step(&mut self, cmd: CoverCommand, now: Instant) -> CalibrationStep {
        let (next, step) = match (*self, cmd) {
            (Calibration::Idle, CoverCommand::Calibrate) => {
                (Calibration::MeasuringDown { started: now }, CalibrationStep::Started)
            }
            (_, CoverCommand::Calibrate) => (Calibration::Idle, CalibrationStep::Cancelled),
            (Calibration::MeasuringDown { started }, CoverCommand::Stop) => (
                Calibration::Settling,
                CalibrationStep::DownMeasured(now.saturating_duration_since(started)),
            ),
            (Calibration::MeasuringUp { started }, CoverCommand::Stop) => {
                (Calibration::Idle, CalibrationStep::UpMeasured(now.saturating_duration_since(started)))
            }
            (state, other) => (state, CalibrationStep::Ignored(other)),
        };
        *self = next;
        step
    }

    /// Ends the settle pause; the upward clock runs from `now`.
    /// Returns false if the measurement was cancelled meanwhile.
    pub fn begin_up(&mut self, now: Instant) -> bool {
        if *self != Calibration::Settling {
            return false;
        }
        *self = Calibration::MeasuringUp { started: now };
        true
    }
}
