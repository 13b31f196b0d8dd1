pub mod discovery;
pub mod frame;
pub mod topic;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("invalid address {0:?}: expected 6 hex characters")]
    InvalidAddress(String),

    #[error("malformed frame {line:?}: {reason}")]
    Malformed { line: String, reason: &'static str },
}
