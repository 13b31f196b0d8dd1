use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::error::{Result, SomfyError};

/// Subdirectory of the state dir holding one `<name>.json` per shutter.
pub const RECORD_SUBDIR: &str = "somfy";

/// Persisted state of one shutter (remote channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub address: String,
    pub name: String,
    pub device_class: String,
    pub rolling_code: u16,
    pub enc_key: u8,

    /// Seconds for a full run from closed to open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_time: Option<f64>,
    /// Seconds for a full run from open to closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_pos: Option<u8>,

    // keys we don't know about survive a save
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DeviceRecord {
    pub fn new(address: &str, name: &str, device_class: &str) -> Self {
        Self {
            address: address.to_string(),
            name: name.to_string(),
            device_class: device_class.to_string(),
            rolling_code: 0,
            enc_key: 0,
            up_time: None,
            down_time: None,
            current_pos: None,
            extra: Default::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let load_err = |reason: String| SomfyError::RecordLoad { path: path.to_path_buf(), reason };

        let s = fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let mut rec: DeviceRecord = serde_json::from_str(&s).map_err(|e| load_err(e.to_string()))?;

        cul_proto::frame::validate_address(&rec.address).map_err(|e| load_err(e.to_string()))?;
        if rec.enc_key > 0x0F {
            return Err(load_err(format!("enc_key {} exceeds 4 bits", rec.enc_key)));
        }
        if let Some(pos) = rec.current_pos.filter(|p| *p > 100) {
            warn!("somfy: {} current_pos {} out of range, clamping", path.display(), pos);
            rec.current_pos = Some(100);
        }
        Ok(rec)
    }

    /// Write to a sibling temp file, then rename over the record.
    pub fn save(&self, path: &Path) -> Result<()> {
        let save_err = |reason: String| SomfyError::PersistenceWrite { path: path.to_path_buf(), reason };

        let json = serde_json::to_string(self).map_err(|e| save_err(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| save_err(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| save_err(e.to_string()))?;
        Ok(())
    }

    /// Rolling code +1 mod 2^16, enc key +1 mod 2^4.
    pub fn advance_rolling_code(&mut self) {
        self.rolling_code = self.rolling_code.wrapping_add(1);
        self.enc_key = (self.enc_key + 1) & 0x0F;
        info!("somfy: next rolling code for device {} is {}", self.address, self.rolling_code);
    }

    pub fn set_position(&mut self, pos: u8) {
        self.current_pos = Some(pos.min(100));
    }
}

/// Loads every `*.json` below `<state_dir>/somfy`, sorted by file name.
///
/// A broken record is logged and skipped; an unreadable directory is an error.
pub fn load_all(state_dir: &Path) -> Result<Vec<(PathBuf, DeviceRecord)>> {
    let dir = state_dir.join(RECORD_SUBDIR);
    let entries = fs::read_dir(&dir).map_err(|source| SomfyError::RecordDirectory { path: dir.clone(), source })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        match DeviceRecord::load(&path) {
            Ok(rec) => out.push((path, rec)),
            Err(e) => error!("somfy: skipping record: {}", e),
        }
    }
    Ok(out)
}
