use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_serial::SerialPort;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{CulConfig, FrameSink};

/// One text line received from the CUL.
#[derive(Debug, Clone)]
pub struct RfLine {
    pub text: String,
    pub ts: OffsetDateTime,
}

pub struct SerialTransport {
    device: String,
    poll_interval: Duration,
    writer: Mutex<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn open(cfg: &CulConfig) -> Result<Self> {
        anyhow::ensure!(Path::new(&cfg.device).exists(), "cannot find CUL device {}", cfg.device);
        let port = tokio_serial::new(&cfg.device, cfg.baud_rate)
            .timeout(Duration::from_millis(cfg.read_timeout_ms))
            .open()
            .with_context(|| format!("open CUL device {}", cfg.device))?;
        info!("cul: opened {} @ {}", cfg.device, cfg.baud_rate);
        Ok(Self {
            device: cfg.device.clone(),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            writer: Mutex::new(port),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Fresh receive sequence on a cloned handle of the port. Can be called again
    /// after a previous sequence ended.
    pub fn lines(&self, cancel: CancellationToken) -> Result<CulLines<Box<dyn SerialPort>>> {
        let port = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("serial writer lock poisoned"))?
            .try_clone()
            .context("clone serial port for reading")?;
        Ok(CulLines::new(port, self.poll_interval, cancel))
    }
}

impl FrameSink for SerialTransport {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let mut port = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("serial writer lock poisoned"))?;
        port.write_all(frame).with_context(|| format!("write to {}", self.device))?;
        port.flush().with_context(|| format!("flush {}", self.device))?;
        debug!("cul: sent {}", String::from_utf8_lossy(frame).trim_end());
        Ok(())
    }
}

/// Lazy, endless sequence of lines read from the CUL.
///
/// Each read blocks for at most the port timeout. Timeouts and read errors never
/// end the sequence; only cancellation does.
pub struct CulLines<R> {
    reader: BufReader<R>,
    pending: String,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl<R: Read> CulLines<R> {
    pub fn new(source: R, poll_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            reader: BufReader::new(source),
            pending: String::new(),
            poll_interval,
            cancel,
        }
    }

    fn read_once(&mut self) -> Option<String> {
        match self.reader.read_line(&mut self.pending) {
            Ok(_) if self.pending.ends_with('\n') => {
                let line = self.pending.trim().to_string();
                self.pending.clear();
                (!line.is_empty()).then_some(line)
            }
            // EOF or partial line; keep what we have and wait for more
            Ok(_) => None,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => None,
            Err(e) => {
                warn!("cul: read failed: {}", e);
                self.pending.clear();
                None
            }
        }
    }
}

impl<R: Read> Iterator for CulLines<R> {
    type Item = RfLine;

    fn next(&mut self) -> Option<RfLine> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(text) = self.read_once() {
                debug!("cul: received {}", text);
                return Some(RfLine { text, ts: OffsetDateTime::now_utc() });
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}
