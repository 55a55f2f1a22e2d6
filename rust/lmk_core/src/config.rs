// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Startup configuration. Every field has a default matching the shipped
//! driver, so an empty JSON object is a valid configuration.

use std::fs;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::MAX_VICTIM_SLOTS;

/// Reclaim-pressure weight reported to the host, `DEFAULT_SEEKS * 16`.
pub const DEFAULT_COST: i32 = 32;

pub const MAX_DEBUG_LEVEL: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmkConfig {
    /// Priority thresholds in `oom_adj` units.
    pub adj: Vec<i32>,
    /// Free-page floors, ascending.
    pub minfree: Vec<u64>,
    /// Debounce window after a kill.
    pub timeout_ms: u64,
    pub cost: i32,
    pub debug_level: u32,
    /// Victims selected per pressure pass.
    pub victim_slots: usize,
    pub soft_reclaim: SoftReclaimConfig,
}

impl Default for LmkConfig {
    fn default() -> Self {
        Self {
            adj: vec![0, 1, 6, 12],
            minfree: vec![1536, 2048, 4096, 16384],
            timeout_ms: 1000,
            cost: DEFAULT_COST,
            debug_level: 2,
            victim_slots: 1,
            soft_reclaim: SoftReclaimConfig::default(),
        }
    }
}

impl LmkConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).context("Failed to parse lmk configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.debug_level > MAX_DEBUG_LEVEL {
            bail!(
                "debug_level {} out of range (0-{})",
                self.debug_level,
                MAX_DEBUG_LEVEL
            );
        }
        if self.victim_slots == 0 || self.victim_slots > MAX_VICTIM_SLOTS {
            bail!(
                "victim_slots {} out of range (1-{})",
                self.victim_slots,
                MAX_VICTIM_SLOTS
            );
        }
        if self.cost <= 0 {
            bail!("cost must be positive, got {}", self.cost);
        }
        if self.soft_reclaim.nr_reclaim == 0 {
            bail!("soft_reclaim.nr_reclaim must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftReclaimConfig {
    /// Spawn the `kcompcached` worker.
    pub enabled: bool,
    /// Pages requested per attempt.
    pub nr_reclaim: u64,
    /// Free compressed-swap pages required before an attempt.
    pub min_freeswap: u64,
    /// An attempt reclaiming fewer pages than this cancels the request.
    pub min_reclaim: u64,
    pub min_interval_ms: u64,
}

impl SoftReclaimConfig {
    /// Defaults scaled to the number of online CPUs.
    pub fn for_cpus(nr_cpus: usize) -> Self {
        if nr_cpus > 1 {
            Self {
                enabled: true,
                nr_reclaim: 2048,
                min_freeswap: 2048 * 2 * nr_cpus as u64,
                min_reclaim: 256,
                min_interval_ms: 5000,
            }
        } else {
            Self {
                enabled: true,
                nr_reclaim: 1024,
                min_freeswap: 2048,
                min_reclaim: 128,
                min_interval_ms: 10000,
            }
        }
    }
}

impl Default for SoftReclaimConfig {
    fn default() -> Self {
        Self::for_cpus(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_is_default() {
        let config = LmkConfig::from_json("{}").unwrap();
        assert_eq!(config, LmkConfig::default());
        assert_eq!(config.soft_reclaim.min_freeswap, 8192);
    }

    #[test]
    fn test_partial_override() {
        let config = LmkConfig::from_json(
            r#"
            {
                "adj": [0, 8],
                "minfree": [1024, 4096],
                "victim_slots": 3,
                "soft_reclaim": { "min_reclaim": 64 }
            }
            "#,
        )
        .unwrap();
        assert_eq!(config.adj, vec![0, 8]);
        assert_eq!(config.minfree, vec![1024, 4096]);
        assert_eq!(config.victim_slots, 3);
        assert_eq!(config.timeout_ms, 1000);
        assert_eq!(config.soft_reclaim.min_reclaim, 64);
        assert_eq!(config.soft_reclaim.nr_reclaim, 2048);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(LmkConfig::from_json(r#"{"debug_level": 6}"#).is_err());
        assert!(LmkConfig::from_json(r#"{"victim_slots": 0}"#).is_err());
        assert!(LmkConfig::from_json(r#"{"victim_slots": 4}"#).is_err());
        assert!(LmkConfig::from_json(r#"{"cost": 0}"#).is_err());
        assert!(LmkConfig::from_json(r#"{"soft_reclaim": {"nr_reclaim": 0}}"#).is_err());
        assert!(LmkConfig::from_json(r#"{"adj": "0,1"}"#).is_err());
    }

    #[test]
    fn test_uniprocessor_defaults() {
        let up = SoftReclaimConfig::for_cpus(1);
        assert_eq!(up.nr_reclaim, 1024);
        assert_eq!(up.min_freeswap, 2048);
        assert_eq!(up.min_reclaim, 128);
        assert_eq!(up.min_interval_ms, 10000);

        let smp = SoftReclaimConfig::for_cpus(8);
        assert_eq!(smp.min_freeswap, 2048 * 2 * 8);
        assert_eq!(smp.min_interval_ms, 5000);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"timeout_ms": 250, "debug_level": 4}}"#).unwrap();

        let config = LmkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.debug_level, 4);

        assert!(LmkConfig::from_file("/nonexistent/lmk.json").is_err());
    }
}
