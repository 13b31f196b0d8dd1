use std::path::PathBuf;
use thiserror::Error;

use cul_proto::FrameError;

#[derive(Error, Debug)]
pub enum SomfyError {
    #[error("cannot handle topic {0}")]
    Topic(String),

    #[error("device not found: {0}")]
    UnknownDevice(String),

    #[error("command {0:?} is not supported")]
    UnsupportedCommand(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The frame may not have left the CUL; the rolling code was not advanced.
    #[error("CUL write failed: {0:#}")]
    Transport(anyhow::Error),

    #[error("command refused: transmitter halted after a failed write")]
    Halted,

    #[error("cannot load {path}: {reason}")]
    RecordLoad { path: PathBuf, reason: String },

    #[error("cannot read state directory {path}: {source}")]
    RecordDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot save {path}: {reason}")]
    PersistenceWrite { path: PathBuf, reason: String },
}

impl SomfyError {
    /// Errors after which no further frame may be sent.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SomfyError::Transport(_) | SomfyError::Halted)
    }
}

pub type Result<T> = std::result::Result<T, SomfyError>;
