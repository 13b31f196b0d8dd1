//! Somfy RTS shutters behind a CUL stick.
//!
//! Somfy is fire-and-forget: the receiver never reports back, so state and
//! position are simulated from the commands sent and the calibrated travel
//! times. The rolling code advances with every frame and must never go back,
//! or the paired motor stops listening.

pub mod calibration;
pub mod command;
pub mod doctor;
pub mod error;
pub mod handler;
pub mod publish;
pub mod record;
pub mod simulator;

use serde::Deserialize;
use std::time::Duration;

use cul_proto::frame::AddressOrder;

pub use command::CoverCommand;
pub use error::SomfyError;
pub use handler::{ShutterProtocolHandler, ShutterSnapshot};
pub use publish::{CoverState, Publisher};
pub use record::DeviceRecord;

#[derive(Debug, Clone, Deserialize)]
pub struct SomfyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Pause between the `my` and `up` frames while calibrating.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Only change for newly paired remotes; existing pairings use the stored order.
    #[serde(default)]
    pub address_order: AddressOrder,
}

impl Default for SomfyConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            settle_delay_ms: default_settle_delay_ms(),
            address_order: AddressOrder::default(),
        }
    }
}

impl SomfyConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn default_enabled() -> bool { true }
fn default_settle_delay_ms() -> u64 { 2000 }
