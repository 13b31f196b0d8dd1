use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use cul_proto::discovery::CoverConfig;
use cul_proto::frame::{self, AddressOrder, SomfyCommand};
use cul_proto::topic::{device_base, DeviceTopic};
use cul_serial::FrameSink;

use crate::calibration::{Calibration, CalibrationStep};
use crate::command::CoverCommand;
use crate::error::{Result, SomfyError};
use crate::publish::{CoverState, Publisher};
use crate::record::{load_all, DeviceRecord};
use crate::simulator::{self, Direction, Motion, MotionTimer, Plan};
use crate::SomfyConfig;

pub const DEVICE_TYPE: &str = "cover";
pub const COMPONENT: &str = "somfy";

/// One shutter: its record plus everything that only lives in memory.
#[derive(Debug)]
pub struct Shutter {
    path: PathBuf,
    record: DeviceRecord,
    base: String,
    motion: Motion,
    timer: MotionTimer,
    calibration: Calibration,
}

type SharedShutter = Arc<Mutex<Shutter>>;

impl Shutter {
    fn new(prefix: &str, path: PathBuf, record: DeviceRecord) -> Self {
        let base = device_base(prefix, DEVICE_TYPE, COMPONENT, &record.address);
        Self {
            path,
            record,
            base,
            motion: Motion::default(),
            timer: MotionTimer::default(),
            calibration: Calibration::default(),
        }
    }

    fn topic(&self, leaf: &str) -> String {
        format!("{}/{}", self.base, leaf)
    }

    fn persist(&self) {
        if let Err(e) = self.record.save(&self.path) {
            error!("somfy: {}", e);
        }
    }

    fn send(&self, publisher: &dyn Publisher, leaf: &str, payload: &str) {
        let topic = self.topic(leaf);
        if let Err(e) = publisher.publish(&topic, payload, true) {
            warn!("somfy: publish {} failed: {:#}", topic, e);
        }
    }

    /// State is always published; position only when it changed, and then saved.
    fn publish_state(&mut self, publisher: &dyn Publisher, state: CoverState, position: Option<u8>) {
        debug!("somfy: {} state={} position={:?}", self.record.address, state, position);
        self.send(publisher, "state", state.as_str());
        if let Some(pos) = position.map(|p| p.min(100)) {
            if self.record.current_pos != Some(pos) {
                self.record.set_position(pos);
                self.send(publisher, "position", &pos.to_string());
                self.persist();
            }
        }
    }

    fn announce(&mut self, publisher: &dyn Publisher) {
        let config = CoverConfig::somfy(&self.base, &self.record.address, &self.record.name, &self.record.device_class);
        match config.to_json() {
            Ok(json) => self.send(publisher, "config", &json),
            Err(e) => error!("somfy: cannot encode discovery for {}: {}", self.record.address, e),
        }

        // a reconnect in the middle of a run or a measurement keeps that state
        let live = if self.calibration.is_active() {
            Some(CoverState::Calibrating)
        } else if self.timer.is_armed() && self.motion.direction != Direction::Idle {
            Some(self.motion.direction.moving_state())
        } else {
            None
        };
        if let Some(state) = live {
            self.send(publisher, "state", state.as_str());
            if let Some(pos) = self.record.current_pos {
                self.send(publisher, "position", &pos.to_string());
            }
            return;
        }

        let (state, pos) = simulator::initial_state(&self.record);
        let changed = self.record.current_pos != Some(pos);
        self.publish_state(publisher, state, Some(pos));
        if !changed {
            // retained position may be stale on a fresh broker
            self.send(publisher, "position", &pos.to_string());
        }
    }

    fn end_motion(&mut self, publisher: &dyn Publisher, state: CoverState, position: u8) {
        self.motion = Motion::default();
        self.publish_state(publisher, state, Some(position));
    }
}

/// Read-only view of one shutter.
#[derive(Debug, Clone)]
pub struct ShutterSnapshot {
    pub record: DeviceRecord,
    pub direction: Direction,
    pub timer_armed: bool,
    pub calibrating: bool,
}

/// Write side shared by the handler and its timer tasks. The first failed
/// write latches `halted` for good.
#[derive(Clone)]
struct Radio {
    sink: Arc<dyn FrameSink>,
    address_order: AddressOrder,
    halted: Arc<watch::Sender<bool>>,
}

impl Radio {
    fn is_halted(&self) -> bool {
        *self.halted.borrow()
    }

    /// Sends one frame, then advances and saves the rolling code. A failed
    /// write halts the handler and leaves the code untouched.
    fn transmit(&self, shutter: &mut Shutter, cmd: SomfyCommand) -> Result<()> {
        if self.is_halted() {
            return Err(SomfyError::Halted);
        }
        let rec = &shutter.record;
        let line = frame::encode(cmd, rec.enc_key, rec.rolling_code, &rec.address, self.address_order)?;
        info!(
            "somfy: sending {} to {}: {}",
            cmd,
            rec.name,
            String::from_utf8_lossy(&line).trim_end()
        );

        if let Err(e) = self.sink.send_frame(&line) {
            self.halted.send_replace(true);
            error!("somfy: write failed for {}, refusing further commands: {:#}", rec.address, e);
            return Err(SomfyError::Transport(e));
        }

        shutter.record.advance_rolling_code();
        shutter.persist();
        Ok(())
    }
}

pub struct ShutterProtocolHandler {
    prefix: String,
    settle_delay: std::time::Duration,
    radio: Radio,
    publisher: Arc<dyn Publisher>,
    devices: BTreeMap<String, SharedShutter>,
}

impl ShutterProtocolHandler {
    /// Loads all records below `state_dir`; fails only if the directory is unreadable.
    pub fn load(
        cfg: &SomfyConfig,
        prefix: &str,
        state_dir: &Path,
        sink: Arc<dyn FrameSink>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let records = load_all(state_dir)?;
        Ok(Self::new(cfg, prefix, records, sink, publisher))
    }

    pub fn new(
        cfg: &SomfyConfig,
        prefix: &str,
        records: Vec<(PathBuf, DeviceRecord)>,
        sink: Arc<dyn FrameSink>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let mut devices = BTreeMap::new();
        for (path, record) in records {
            let address = record.address.clone();
            if devices.contains_key(&address) {
                warn!("somfy: duplicate address {} in {}, ignoring", address, path.display());
                continue;
            }
            info!("somfy: loaded {} ({}) from {}", record.name, address, path.display());
            devices.insert(address, Arc::new(Mutex::new(Shutter::new(prefix, path, record))));
        }

        Self {
            prefix: prefix.to_string(),
            settle_delay: cfg.settle_delay(),
            radio: Radio {
                sink,
                address_order: cfg.address_order,
                halted: Arc::new(watch::channel(false).0),
            },
            publisher,
            devices,
        }
    }

    pub fn component_name() -> &'static str {
        COMPONENT
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn is_halted(&self) -> bool {
        self.radio.is_halted()
    }

    /// Flips to `true` on the first failed write, including writes made by
    /// timer tasks outside of `on_message`.
    pub fn halt_signal(&self) -> watch::Receiver<bool> {
        self.radio.halted.subscribe()
    }

    pub async fn snapshot(&self, address: &str) -> Option<ShutterSnapshot> {
        let dev = self.devices.get(address)?;
        let s = dev.lock().await;
        Some(ShutterSnapshot {
            record: s.record.clone(),
            direction: s.motion.direction,
            timer_armed: s.timer.is_armed(),
            calibrating: s.calibration.is_active(),
        })
    }

    /// Discovery config plus current state and position for every shutter.
    pub async fn announce(&self) {
        for dev in self.devices.values() {
            dev.lock().await.announce(self.publisher.as_ref());
        }
    }

    /// Handles one MQTT message. Only errors after which nothing may be sent
    /// anymore are returned; everything else is logged and dropped.
    pub async fn on_message(&self, topic: &str, payload: &[u8]) -> Result<()> {
        match self.dispatch(topic, payload).await {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("somfy: {}", e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let t = DeviceTopic::parse(topic).map_err(|e| SomfyError::Topic(e.to_string()))?;
        if t.prefix != self.prefix {
            info!("somfy: ignoring message due to prefix: {}", topic);
            return Ok(());
        }
        if t.device_type != DEVICE_TYPE {
            return Err(SomfyError::Topic(format!("{topic} (somfy can only handle covers)")));
        }
        if t.component != COMPONENT {
            return Err(SomfyError::Topic(format!("{topic} (different component)")));
        }
        let dev = self
            .devices
            .get(t.address)
            .ok_or_else(|| SomfyError::UnknownDevice(t.address.to_string()))?;

        if t.subtopic != "set" {
            debug!("somfy: ignoring topic {}", topic);
            return Ok(());
        }

        let cmd: CoverCommand = String::from_utf8_lossy(payload).parse()?;
        let mut shutter = dev.lock().await;
        info!("somfy: {} -> {}", cmd, shutter.record.name);

        if cmd == CoverCommand::Calibrate || shutter.calibration.is_active() {
            return self.calibrate(dev, &mut shutter, cmd);
        }

        let Some(rf) = cmd.rf_command() else {
            return Err(SomfyError::UnsupportedCommand(cmd.to_string()));
        };
        self.radio.transmit(&mut shutter, rf)?;

        match cmd {
            CoverCommand::Open => self.start_motion(dev, &mut shutter, Direction::Opening),
            CoverCommand::Close => self.start_motion(dev, &mut shutter, Direction::Closing),
            CoverCommand::Stop => self.stop_motion(&mut shutter),
            CoverCommand::Prog | CoverCommand::Calibrate => {}
        }
        Ok(())
    }

    fn start_motion(&self, dev: &SharedShutter, shutter: &mut Shutter, direction: Direction) {
        match simulator::plan(&shutter.record, direction) {
            Plan::Arrive { end, position } => {
                shutter.timer.cancel();
                shutter.end_motion(self.publisher.as_ref(), end, position);
            }
            Plan::Travel { moving, travel, end, position } => {
                shutter.publish_state(self.publisher.as_ref(), moving, None);
                let generation = shutter.timer.next_generation();
                shutter.motion = Motion::started(direction, Instant::now());
                debug!("somfy: {} {} for {:?}", shutter.record.address, moving, travel);

                let dev = Arc::clone(dev);
                let publisher = Arc::clone(&self.publisher);
                let task = tokio::spawn(async move {
                    tokio::time::sleep(travel).await;
                    let mut s = dev.lock().await;
                    if s.timer.fire(generation) {
                        s.end_motion(publisher.as_ref(), end, position);
                    }
                });
                shutter.timer.arm(generation, task);
            }
        }
    }

    fn stop_motion(&self, shutter: &mut Shutter) {
        let was_armed = shutter.timer.cancel();
        let pos = simulator::stop_position(&shutter.record, &shutter.motion, was_armed, Instant::now());
        shutter.end_motion(self.publisher.as_ref(), CoverState::Stopped, pos);
    }

    fn calibrate(&self, dev: &SharedShutter, shutter: &mut Shutter, cmd: CoverCommand) -> Result<()> {
        let publisher = self.publisher.as_ref();
        match shutter.calibration.step(cmd, Instant::now()) {
            CalibrationStep::Started => {
                shutter.timer.cancel();
                shutter.motion = Motion::default();
                info!("somfy: calibrating {}, send STOP when fully closed", shutter.record.name);
                self.radio.transmit(shutter, SomfyCommand::Down)?;
                shutter.publish_state(publisher, CoverState::Calibrating, None);
            }
            CalibrationStep::Cancelled => {
                shutter.timer.cancel();
                info!("somfy: calibration of {} interrupted", shutter.record.name);
                shutter.publish_state(publisher, CoverState::Stopped, None);
            }
            CalibrationStep::DownMeasured(took) => {
                info!("somfy: {} down_time {:.1}s, send STOP when fully open", shutter.record.name, took.as_secs_f64());
                shutter.record.down_time = Some(took.as_secs_f64());
                shutter.persist();
                self.radio.transmit(shutter, SomfyCommand::My)?;
                self.schedule_up_run(dev, shutter);
            }
            CalibrationStep::UpMeasured(took) => {
                info!("somfy: {} up_time {:.1}s, calibration done", shutter.record.name, took.as_secs_f64());
                shutter.record.up_time = Some(took.as_secs_f64());
                shutter.persist();
                self.radio.transmit(shutter, SomfyCommand::My)?;
                shutter.publish_state(publisher, CoverState::Open, Some(100));
            }
            CalibrationStep::Ignored(other) => {
                warn!("somfy: ignoring {} for {} while calibrating", other, shutter.record.name);
            }
        }
        Ok(())
    }

    /// Sends `up` once the settle delay has passed. Only this shutter waits;
    /// the upward clock starts at the deadline.
    fn schedule_up_run(&self, dev: &SharedShutter, shutter: &mut Shutter) {
        let generation = shutter.timer.next_generation();
        let deadline = Instant::now() + self.settle_delay;
        let dev = Arc::clone(dev);
        let radio = self.radio.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut s = dev.lock().await;
            if !s.timer.fire(generation) || !s.calibration.begin_up(deadline) {
                return;
            }
            if let Err(e) = radio.transmit(&mut s, SomfyCommand::Up) {
                error!("somfy: calibration of {} stopped: {}", s.record.name, e);
            }
        });
        shutter.timer.arm(generation, task);
    }

    /// Somfy lines heard on the air, including the CUL echo of our own frames.
    /// Logged only; RTS receivers send no state back.
    pub fn on_rf_message(&self, line: &str) {
        match frame::parse(line) {
            Ok(f) => {
                let known = self.devices.contains_key(&f.address);
                debug!(
                    "somfy: rf {} key={:X} rc={} addr={} known={} checksum_ok={}",
                    f.command.map(|c| c.name()).unwrap_or("?"),
                    f.enc_key,
                    f.rolling_code,
                    f.address,
                    known,
                    f.checksum_ok,
                );
            }
            Err(e) => warn!("somfy: {}", e),
        }
    }

    /// Cancels all timers and saves every record.
    pub async fn shutdown(&self) {
        for dev in self.devices.values() {
            let mut s = dev.lock().await;
            s.timer.cancel();
            s.persist();
        }
        info!("somfy: state saved for {} devices", self.devices.len());
    }
}
