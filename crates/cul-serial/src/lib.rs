pub mod doctor;
pub mod transport;
pub mod version;

use anyhow::Result;
use serde::Deserialize;
use tracing::info;

pub use transport::{CulLines, RfLine, SerialTransport};

#[derive(Debug, Clone, Deserialize)]
pub struct CulConfig {
    /// Serial device of the CUL stick, e.g. /dev/ttyACM0
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Upper bound for one blocking line read.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Pause between reads while the line is idle.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Log frames instead of writing them to the device.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for CulConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            dry_run: false,
        }
    }
}

fn default_device() -> String { "/dev/ttyACM0".into() }
fn default_baud_rate() -> u32 { 115200 }
fn default_read_timeout_ms() -> u64 { 1000 }
fn default_poll_interval_ms() -> u64 { 100 }

/// Anything a finished command line can be written to.
///
/// An `Err` means the frame must be treated as not transmitted.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &[u8]) -> Result<()>;
}

/// Stand-in for the CUL when running without hardware.
#[derive(Debug, Default)]
pub struct DryRunSink;

impl FrameSink for DryRunSink {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        info!("dry-run: {}", String::from_utf8_lossy(frame).trim_end());
        Ok(())
    }
}
