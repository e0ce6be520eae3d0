//! Liveness heartbeat file for external watchdogs.
//!
//! Written atomically (temp file + rename) once per engine cycle, whether or
//! not the cycle produced a signal, so a stalled write is indistinguishable
//! from a stalled engine on purpose.

use crate::logging::ts_now;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRecord {
    pub timestamp: String,
    pub pid: u32,
    pub current_mode: String,
    pub target_mode: String,
    pub last_signal: Option<String>,
    pub online: bool,
    pub test_boot: bool,
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    path: PathBuf,
}

impl Heartbeat {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn write(&self, record: &HeartbeatRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("write heartbeat temp at {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("publish heartbeat at {}", self.path.display()))?;
        Ok(())
    }

    pub fn record(
        mode: &str,
        last_signal: Option<String>,
        online: bool,
        test_boot: bool,
    ) -> HeartbeatRecord {
        HeartbeatRecord {
            timestamp: ts_now(),
            pid: std::process::id(),
            current_mode: mode.to_string(),
            target_mode: mode.to_string(),
            last_signal,
            online,
            test_boot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system_status.json");
        let hb = Heartbeat::new(&path);
        let record = Heartbeat::record("paper", Some("EUR_USD BUY".to_string()), true, false);
        hb.write(&record).unwrap();

        let loaded: HeartbeatRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.pid, std::process::id());
        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn overwrite_replaces_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system_status.json");
        let hb = Heartbeat::new(&path);
        hb.write(&Heartbeat::record("paper", None, true, true)).unwrap();
        hb.write(&Heartbeat::record("paper", Some("idle".to_string()), true, false)).unwrap();

        let loaded: HeartbeatRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.last_signal.as_deref(), Some("idle"));
        assert!(!loaded.test_boot);
    }
}
