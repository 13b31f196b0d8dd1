//! Recording doubles for the CUL and the MQTT session.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cul_proto::frame::{self, SomfyCommand};
use cul_serial::FrameSink;
use cul_somfy::record::RECORD_SUBDIR;
use cul_somfy::{DeviceRecord, Publisher, ShutterProtocolHandler, SomfyConfig};

pub const PREFIX: &str = "homeassistant";
pub const ADDR: &str = "A1B2C3";
/// Default pause between `my` and `up` while calibrating.
pub const SETTLE: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl FrameSink for RecordingSink {
    fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("device unplugged");
        }
        self.frames.lock().unwrap().push(String::from_utf8(frame.to_vec())?);
        Ok(())
    }
}

impl RecordingSink {
    pub fn commands(&self) -> Vec<SomfyCommand> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|l| frame::parse(l).unwrap().command.unwrap())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub messages: Mutex<Vec<(String, String, bool)>>,
}

impl Publisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push((topic.to_string(), payload.to_string(), retain));
        Ok(())
    }
}

impl RecordingPublisher {
    /// Payloads published to `<base>/<leaf>`, oldest first.
    pub fn payloads(&self, leaf: &str) -> Vec<String> {
        let topic = format!("{PREFIX}/cover/somfy/{ADDR}/{leaf}");
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| *t == topic)
            .map(|(_, p, _)| p.clone())
            .collect()
    }

    pub fn last(&self, leaf: &str) -> Option<String> {
        self.payloads(leaf).pop()
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

pub struct Rig {
    pub dir: tempfile::TempDir,
    pub sink: Arc<RecordingSink>,
    pub publisher: Arc<RecordingPublisher>,
    pub handler: ShutterProtocolHandler,
}

impl Rig {
    pub fn record_path(&self) -> PathBuf {
        self.dir.path().join(RECORD_SUBDIR).join("shutter.json")
    }

    pub fn stored(&self) -> DeviceRecord {
        DeviceRecord::load(&self.record_path()).unwrap()
    }

    pub async fn send(&self, payload: &str) -> cul_somfy::error::Result<()> {
        self.handler.on_message(&set_topic(ADDR), payload.as_bytes()).await
    }
}

pub fn set_topic(address: &str) -> String {
    format!("{PREFIX}/cover/somfy/{address}/set")
}

pub fn shutter(up: Option<f64>, down: Option<f64>, pos: Option<u8>) -> DeviceRecord {
    let mut rec = DeviceRecord::new(ADDR, "Living room", "shutter");
    rec.rolling_code = 0x0100;
    rec.enc_key = 0x5;
    rec.up_time = up;
    rec.down_time = down;
    rec.current_pos = pos;
    rec
}

pub fn write_record(dir: &Path, rec: &DeviceRecord) {
    let sub = dir.join(RECORD_SUBDIR);
    std::fs::create_dir_all(&sub).unwrap();
    rec.save(&sub.join("shutter.json")).unwrap();
}

pub fn rig(rec: DeviceRecord) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    write_record(dir.path(), &rec);

    let sink = Arc::new(RecordingSink::default());
    let publisher = Arc::new(RecordingPublisher::default());
    let handler = ShutterProtocolHandler::load(
        &SomfyConfig::default(),
        PREFIX,
        dir.path(),
        sink.clone(),
        publisher.clone(),
    )
    .unwrap();

    Rig { dir, sink, publisher, handler }
}

/// Collects formatted log output of the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .filter(|l| l.contains(needle))
            .map(str::to_string)
            .collect()
    }
}
