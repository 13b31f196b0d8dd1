use std::fmt;
use std::str::FromStr;

use cul_proto::frame::SomfyCommand;

use crate::error::SomfyError;

/// Payloads accepted on `.../set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverCommand {
    Open,
    Close,
    Stop,
    Prog,
    Calibrate,
}

impl CoverCommand {
    /// RF command sent for a plain (non-calibration) request.
    pub fn rf_command(self) -> Option<SomfyCommand> {
        match self {
            CoverCommand::Open => Some(SomfyCommand::Up),
            CoverCommand::Close => Some(SomfyCommand::Down),
            CoverCommand::Stop => Some(SomfyCommand::My),
            CoverCommand::Prog => Some(SomfyCommand::Prog),
            CoverCommand::Calibrate => None,
        }
    }
}

impl FromStr for CoverCommand {
    type Err = SomfyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "OPEN" => CoverCommand::Open,
            "CLOSE" => CoverCommand::Close,
            "STOP" => CoverCommand::Stop,
            "PROG" => CoverCommand::Prog,
            "CALIBRATE" => CoverCommand::Calibrate,
            other => return Err(SomfyError::UnsupportedCommand(other.to_string())),
        })
    }
}

impl fmt::Display for CoverCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoverCommand::Open => "OPEN",
            CoverCommand::Close => "CLOSE",
            CoverCommand::Stop => "STOP",
            CoverCommand::Prog => "PROG",
            CoverCommand::Calibrate => "CALIBRATE",
        };
        f.write_str(s)
    }
}
