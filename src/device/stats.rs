//! Durable device statistics (spec §4.3.1).
//!
//! Grounded on two real atomic-rename sites in the retrieved pack: the
//! teacher's own `write_output_atomic` in `src/bin/backtest_run.rs`
//! (temp file + rename) and `groblegark-coop`'s
//! `credential::persist::save` (same idiom, JSON + `serde`). This module
//! extends that two-step idiom to the three-step version spec.md asks
//! for, so a crash between the write and the final rename can still be
//! recovered from the `.bak` sibling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatistics {
    pub coins_inserted: u64,
    pub coins_dispensed: u64,
    pub coins_refunded: u64,
    pub coins_returned_front: u64,
    pub coins_returned_left: u64,
    pub coins_returned_right: u64,
    pub tickets_printed: u64,
    pub faults: u64,
    pub recoveries: u64,
}

impl DeviceStatistics {
    /// Fraction of returned coins that exited the front of the cabinet.
    pub fn return_rate(&self) -> f64 {
        let total = self.coins_returned_front + self.coins_returned_left + self.coins_returned_right;
        if total == 0 {
            return 0.0;
        }
        self.coins_returned_front as f64 / total as f64
    }
}

#[derive(Debug)]
pub enum StatsError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "statistics I/O error: {e}"),
            Self::Serialization(e) => write!(f, "statistics serialization error: {e}"),
        }
    }
}

impl std::error::Error for StatsError {}

impl From<std::io::Error> for StatsError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for StatsError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

/// Day-partitioned `statistics_YYYYMMDD` file store with `.tmp`/`.bak`
/// atomic writes.
#[derive(Clone)]
pub struct StatsStore {
    dir: PathBuf,
}

impl StatsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("statistics_{}", at.format("%Y%m%d")))
    }

    /// Load today's file if present. Absence is not an error (spec §4.3.1).
    pub fn load(&self, at: DateTime<Utc>) -> Result<DeviceStatistics, StatsError> {
        let path = self.path_for(at);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeviceStatistics::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `stats` atomically: write `.tmp`, rename the existing
    /// target (if any) to `.bak`, rename `.tmp` to target, unlink
    /// `.bak`. On failure at any step, restore from `.bak` if present.
    pub fn save(&self, stats: &DeviceStatistics, at: DateTime<Utc>) -> Result<(), StatsError> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.path_for(at);
        let tmp = target.with_extension("tmp");
        let bak = target.with_extension("bak");

        let json = serde_json::to_vec_pretty(stats)?;
        if let Err(e) = std::fs::write(&tmp, &json) {
            return Err(e.into());
        }

        let had_target = target.exists();
        if had_target {
            if let Err(e) = std::fs::rename(&target, &bak) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e.into());
            }
        }

        if let Err(e) = std::fs::rename(&tmp, &target) {
            restore_backup(&bak, &target);
            return Err(e.into());
        }

        if had_target {
            let _ = std::fs::remove_file(&bak);
        }
        Ok(())
    }
}

fn restore_backup(bak: &Path, target: &Path) {
    if bak.exists() {
        let _ = std::fs::rename(bak, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 31, 12, 0, 0).unwrap()
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::new(dir.path());
        let mut stats = DeviceStatistics::default();
        stats.coins_inserted = 5;
        stats.coins_returned_front = 3;
        stats.coins_returned_left = 1;
        store.save(&stats, at()).unwrap();
        let loaded = store.load(at()).unwrap();
        assert_eq!(loaded, stats);
    }

    #[test]
    fn missing_file_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::new(dir.path());
        assert_eq!(store.load(at()).unwrap(), DeviceStatistics::default());
    }

    #[test]
    fn no_tmp_or_bak_survives_a_clean_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::new(dir.path());
        store.save(&DeviceStatistics::default(), at()).unwrap();
        store.save(&DeviceStatistics::default(), at()).unwrap();
        assert!(!store.path_for(at()).with_extension("tmp").exists());
        assert!(!store.path_for(at()).with_extension("bak").exists());
    }

    #[test]
    fn return_rate_divides_by_total_returns() {
        let mut stats = DeviceStatistics::default();
        stats.coins_returned_front = 3;
        stats.coins_returned_left = 1;
        assert!((stats.return_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn return_rate_is_zero_with_no_returns() {
        assert_eq!(DeviceStatistics::default().return_rate(), 0.0);
    }
}
