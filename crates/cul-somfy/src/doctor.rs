use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

use crate::record::{load_all, RECORD_SUBDIR};
use crate::SomfyConfig;

/// Checks the record directory and returns how many shutters would load.
pub fn check_records(state_dir: &Path) -> Result<usize> {
    let dir = state_dir.join(RECORD_SUBDIR);
    anyhow::ensure!(dir.is_dir(), "somfy state dir missing: {}", dir.display());

    let records = load_all(state_dir)?;
    let mut seen = HashSet::new();
    for (path, rec) in &records {
        anyhow::ensure!(seen.insert(rec.address.as_str()), "duplicate address {} in {}", rec.address, path.display());
    }
    Ok(records.len())
}

pub fn check_config(cfg: &SomfyConfig) -> Result<()> {
    anyhow::ensure!(cfg.settle_delay_ms <= 10_000, "somfy.settle_delay_ms should be <= 10000");
    Ok(())
}
