use anyhow::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{CulConfig, FrameSink, SerialTransport};

/// Asks culfw for its version string (`V` command).
///
/// Unrelated RF traffic received meanwhile is skipped until `wait` elapses.
pub fn query_version(cfg: &CulConfig, wait: Duration) -> Result<String> {
    let cul = SerialTransport::open(cfg)?;
    cul.send_frame(b"V\n")?;

    // the line sequence only ends on cancellation
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(wait);
            cancel.cancel();
        });
    }

    let mut found = None;
    for line in cul.lines(cancel.clone())? {
        if is_version_line(&line.text) {
            found = Some(line.text);
            break;
        }
        warn!("cul version: skipping {}", line.text);
    }
    cancel.cancel();

    let version = found.ok_or_else(|| anyhow::anyhow!("no version reply from {} within {:?}", cfg.device, wait))?;
    info!("cul version: {}", version);
    Ok(version)
}

fn is_version_line(s: &str) -> bool {
    s.starts_with("V ")
}
