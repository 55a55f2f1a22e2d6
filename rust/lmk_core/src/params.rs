// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Runtime tunables and the named parameter surface used to read and write
//! them while the policy is live.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::config::LmkConfig;
use crate::config::MAX_DEBUG_LEVEL;
use crate::policy::format_list;
use crate::policy::parse_list;
use crate::policy::PolicyHandle;

/// Scalar knobs, each readable and writable independently from any context.
#[derive(Debug)]
pub struct Tunables {
    timeout_ms: AtomicU64,
    cost: AtomicI32,
    debug_level: AtomicU32,
    nr_reclaim: AtomicU64,
    min_freeswap: AtomicU64,
    min_reclaim: AtomicU64,
    min_interval_ms: AtomicU64,
}

impl Tunables {
    pub fn new(config: &LmkConfig) -> Self {
        let sr = &config.soft_reclaim;
        Self {
            timeout_ms: AtomicU64::new(config.timeout_ms),
            cost: AtomicI32::new(config.cost),
            debug_level: AtomicU32::new(config.debug_level),
            nr_reclaim: AtomicU64::new(sr.nr_reclaim),
            min_freeswap: AtomicU64::new(sr.min_freeswap),
            min_reclaim: AtomicU64::new(sr.min_reclaim),
            min_interval_ms: AtomicU64::new(sr.min_interval_ms),
        }
    }

    /// Debounce window after a kill.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn cost(&self) -> i32 {
        self.cost.load(Ordering::Relaxed)
    }

    pub fn debug_level(&self) -> u32 {
        self.debug_level.load(Ordering::Relaxed)
    }

    pub fn nr_reclaim(&self) -> u64 {
        self.nr_reclaim.load(Ordering::Relaxed)
    }

    pub fn min_freeswap(&self) -> u64 {
        self.min_freeswap.load(Ordering::Relaxed)
    }

    pub fn min_reclaim(&self) -> u64 {
        self.min_reclaim.load(Ordering::Relaxed)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.load(Ordering::Relaxed))
    }
}

const PARAM_NAMES: &[&str] = &[
    "adj",
    "minfree",
    "cost",
    "debug_level",
    "timeout",
    "nr_reclaim",
    "min_freeswap",
    "min_reclaim",
    "min_interval",
];

fn parse_scalar<T>(name: &str, val: &str) -> Result<T>
where
    T: std::str::FromStr,
{
    val.trim()
        .parse::<T>()
        .map_err(|_| anyhow!("Invalid value '{}' for {}", val.trim(), name))
}

/// Named access to the policy table and tunables, mirroring the driver's
/// module parameters. A failed write changes nothing.
#[derive(Clone, Copy, Debug)]
pub struct Params<'a> {
    policy: &'a PolicyHandle,
    tunables: &'a Tunables,
}

impl<'a> Params<'a> {
    pub(crate) fn new(policy: &'a PolicyHandle, tunables: &'a Tunables) -> Self {
        Self { policy, tunables }
    }

    pub fn names() -> &'static [&'static str] {
        PARAM_NAMES
    }

    pub fn get(&self, name: &str) -> Result<String> {
        let t = self.tunables;
        Ok(match name {
            "adj" => format_list(self.policy.load().adj()),
            "minfree" => format_list(self.policy.load().minfree()),
            "cost" => t.cost().to_string(),
            "debug_level" => t.debug_level().to_string(),
            "timeout" => t.timeout().as_millis().to_string(),
            "nr_reclaim" => t.nr_reclaim().to_string(),
            "min_freeswap" => t.min_freeswap().to_string(),
            "min_reclaim" => t.min_reclaim().to_string(),
            "min_interval" => t.min_interval().as_millis().to_string(),
            _ => bail!("Unknown parameter '{}'", name),
        })
    }

    pub fn set(&self, name: &str, val: &str) -> Result<()> {
        let t = self.tunables;
        match name {
            "adj" => {
                let adj: Vec<i32> =
                    parse_list(val).with_context(|| format!("Invalid value for {}", name))?;
                let table = self.policy.update(|cur| cur.with_adj(&adj));
                if !table.floors_sorted() {
                    log::warn!("minfree floors are not ascending: {:?}", table.minfree());
                }
            }
            "minfree" => {
                let minfree: Vec<u64> =
                    parse_list(val).with_context(|| format!("Invalid value for {}", name))?;
                let table = self.policy.update(|cur| cur.with_minfree(&minfree));
                if !table.floors_sorted() {
                    log::warn!("minfree floors are not ascending: {:?}", table.minfree());
                }
            }
            "cost" => {
                let cost: i32 = parse_scalar(name, val)?;
                if cost <= 0 {
                    bail!("cost must be positive, got {}", cost);
                }
                t.cost.store(cost, Ordering::Relaxed);
            }
            "debug_level" => {
                let level: u32 = parse_scalar(name, val)?;
                if level > MAX_DEBUG_LEVEL {
                    bail!("debug_level {} out of range (0-{})", level, MAX_DEBUG_LEVEL);
                }
                t.debug_level.store(level, Ordering::Relaxed);
            }
            "timeout" => t.timeout_ms.store(parse_scalar(name, val)?, Ordering::Relaxed),
            "nr_reclaim" => {
                let nr: u64 = parse_scalar(name, val)?;
                if nr == 0 {
                    bail!("nr_reclaim must be positive");
                }
                t.nr_reclaim.store(nr, Ordering::Relaxed);
            }
            "min_freeswap" => t.min_freeswap.store(parse_scalar(name, val)?, Ordering::Relaxed),
            "min_reclaim" => t.min_reclaim.store(parse_scalar(name, val)?, Ordering::Relaxed),
            "min_interval" => t
                .min_interval_ms
                .store(parse_scalar(name, val)?, Ordering::Relaxed),
            _ => bail!("Unknown parameter '{}'", name),
        }
        lmk_print!(t, 3, "param {} set to {}", name, val.trim());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyTable;

    fn fixture() -> (PolicyHandle, Tunables) {
        let config = LmkConfig::default();
        (
            PolicyHandle::new(PolicyTable::new(&config.adj, &config.minfree)),
            Tunables::new(&config),
        )
    }

    #[test]
    fn test_get_defaults() {
        let (policy, tunables) = fixture();
        let params = Params::new(&policy, &tunables);
        assert_eq!(params.get("adj").unwrap(), "0,1,6,12");
        assert_eq!(params.get("minfree").unwrap(), "1536,2048,4096,16384");
        assert_eq!(params.get("cost").unwrap(), "32");
        assert_eq!(params.get("debug_level").unwrap(), "2");
        assert_eq!(params.get("timeout").unwrap(), "1000");
        assert_eq!(params.get("nr_reclaim").unwrap(), "2048");
        assert_eq!(params.get("min_freeswap").unwrap(), "8192");
        assert_eq!(params.get("min_reclaim").unwrap(), "256");
        assert_eq!(params.get("min_interval").unwrap(), "5000");
        assert!(params.get("bogus").is_err());

        for name in Params::names() {
            assert!(params.get(name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_set_lists_swap_table() {
        let (policy, tunables) = fixture();
        let params = Params::new(&policy, &tunables);

        params.set("adj", "0,8").unwrap();
        params.set("minfree", "1024,4096\n").unwrap();
        let table = policy.load();
        assert_eq!(table.adj(), &[0, 8]);
        assert_eq!(table.classify(2000), Some(8));

        // Clamped to capacity rather than rejected.
        params.set("adj", "0,1,2,3,4,5,6,7").unwrap();
        assert_eq!(params.get("adj").unwrap(), "0,1,2,3,4,5");
    }

    #[test]
    fn test_set_scalars() {
        let (policy, tunables) = fixture();
        let params = Params::new(&policy, &tunables);

        params.set("timeout", "250").unwrap();
        assert_eq!(tunables.timeout(), Duration::from_millis(250));
        params.set("debug_level", "5").unwrap();
        assert_eq!(tunables.debug_level(), 5);
        params.set("min_interval", "100").unwrap();
        assert_eq!(tunables.min_interval(), Duration::from_millis(100));
        params.set("min_reclaim", " 64 ").unwrap();
        assert_eq!(tunables.min_reclaim(), 64);
        params.set("min_freeswap", "0").unwrap();
        assert_eq!(tunables.min_freeswap(), 0);
    }

    #[test]
    fn test_rejected_writes_change_nothing() {
        let (policy, tunables) = fixture();
        let params = Params::new(&policy, &tunables);

        assert!(params.set("debug_level", "6").is_err());
        assert!(params.set("cost", "0").is_err());
        assert!(params.set("cost", "abc").is_err());
        assert!(params.set("nr_reclaim", "0").is_err());
        assert!(params.set("timeout", "-1").is_err());
        assert!(params.set("minfree", "1,x").is_err());
        assert!(params.set("nope", "1").is_err());

        assert_eq!(tunables.debug_level(), 2);
        assert_eq!(tunables.cost(), 32);
        assert_eq!(tunables.nr_reclaim(), 2048);
        assert_eq!(tunables.timeout(), Duration::from_secs(1));
        assert_eq!(policy.load().minfree(), &[1536, 2048, 4096, 16384]);
    }
}
