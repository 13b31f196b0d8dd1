use anyhow::Result;
use std::path::Path;

use crate::CulConfig;

pub fn check_device(cfg: &CulConfig) -> Result<()> {
    if !cfg.dry_run {
        anyhow::ensure!(Path::new(&cfg.device).exists(), "cul.device missing: {}", cfg.device);
    }
    anyhow::ensure!(cfg.baud_rate > 0, "cul.baud_rate invalid");
    anyhow::ensure!(
        (100..=10_000).contains(&cfg.read_timeout_ms),
        "cul.read_timeout_ms should be 100..10000"
    );
    anyhow::ensure!(
        (10..=1_000).contains(&cfg.poll_interval_ms),
        "cul.poll_interval_ms should be 10..1000"
    );
    Ok(())
}
