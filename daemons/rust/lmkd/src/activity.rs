// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! System activity readings for the soft-reclaim gate.
//!
//! Queries are answered from the last [`ProcActivity::sample`], which the
//! daemon takes once per tick, so an idle notification never touches procfs.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use lmk_core::host::SystemActivity;

use crate::proc_host::pgscan;
use crate::proc_host::ProcHost;

pub fn sub_or_zero(curr: &u64, prev: &u64) -> u64 {
    curr.checked_sub(*prev).unwrap_or(0)
}

/// Busy fraction of the CPU time that passed between two samples.
pub fn calc_util(curr: &procfs::CpuStat, prev: &procfs::CpuStat) -> Result<f64> {
    match (curr, prev) {
        (
            procfs::CpuStat {
                user_usec: Some(curr_user),
                nice_usec: Some(curr_nice),
                system_usec: Some(curr_system),
                idle_usec: Some(curr_idle),
                iowait_usec: Some(curr_iowait),
                irq_usec: Some(curr_irq),
                softirq_usec: Some(curr_softirq),
                stolen_usec: Some(curr_stolen),
                ..
            },
            procfs::CpuStat {
                user_usec: Some(prev_user),
                nice_usec: Some(prev_nice),
                system_usec: Some(prev_system),
                idle_usec: Some(prev_idle),
                iowait_usec: Some(prev_iowait),
                irq_usec: Some(prev_irq),
                softirq_usec: Some(prev_softirq),
                stolen_usec: Some(prev_stolen),
                ..
            },
        ) => {
            let idle_usec = sub_or_zero(curr_idle, prev_idle);
            let iowait_usec = sub_or_zero(curr_iowait, prev_iowait);
            let busy_usec = sub_or_zero(curr_user, prev_user)
                + sub_or_zero(curr_system, prev_system)
                + sub_or_zero(curr_nice, prev_nice)
                + sub_or_zero(curr_irq, prev_irq)
                + sub_or_zero(curr_softirq, prev_softirq)
                + sub_or_zero(curr_stolen, prev_stolen);
            let total_usec = idle_usec + busy_usec + iowait_usec;
            if total_usec > 0 {
                Ok(((busy_usec as f64) / (total_usec as f64)).clamp(0.0, 1.0))
            } else {
                Ok(1.0)
            }
        }
        _ => {
            bail!("Missing stats in cpustat");
        }
    }
}

/// Runnable tasks from `/proc/loadavg` ("0.10 0.20 0.30 2/345 6789").
pub fn parse_running(loadavg: &str) -> Result<u64> {
    let field = loadavg
        .split_whitespace()
        .nth(3)
        .ok_or_else(|| anyhow!("Short loadavg '{}'", loadavg))?;
    let (running, _) = field
        .split_once('/')
        .ok_or_else(|| anyhow!("Malformed loadavg field '{}'", field))?;
    running.parse().context("Invalid runnable count in loadavg")
}

/// One tick's worth of observations.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ActivitySample {
    pub cpu_busy: f64,
    pub kswapd_active: bool,
    pub free_swap_pages: u64,
    /// Runnable tasks other than ourselves.
    pub load: u64,
    /// Pages scanned by reclaim since the previous sample.
    pub pgscan_delta: u64,
}

struct Prev {
    cpu: Option<procfs::CpuStat>,
    pgscan_kswapd: Option<u64>,
    pgscan: Option<u64>,
}

pub struct ProcActivity {
    proc: Arc<ProcHost>,
    idle_util: f64,
    prev: Mutex<Prev>,

    kswapd_active: AtomicBool,
    cpu_idle: AtomicBool,
    free_swap_pages: AtomicU64,
    load: AtomicU64,
}

impl ProcActivity {
    /// `idle_util` is the busy fraction below which the system counts as
    /// idle.
    pub fn new(proc: Arc<ProcHost>, idle_util: f64) -> Self {
        Self {
            proc,
            idle_util,
            prev: Mutex::new(Prev {
                cpu: None,
                pgscan_kswapd: None,
                pgscan: None,
            }),
            kswapd_active: AtomicBool::new(false),
            cpu_idle: AtomicBool::new(false),
            free_swap_pages: AtomicU64::new(0),
            load: AtomicU64::new(u64::MAX),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.cpu_idle.load(Ordering::Relaxed)
    }

    /// Refresh every activity reading. The first sample only establishes baselines:
    /// it reports the CPU as busy and no reclaim activity.
    pub fn sample(&self) -> Result<ActivitySample> {
        let mut prev = self.prev.lock().unwrap_or_else(PoisonError::into_inner);

        let cpu = self.proc.total_cpu()?;
        let cpu_busy = match &prev.cpu {
            Some(p) => calc_util(&cpu, p)?,
            None => 1.0,
        };
        prev.cpu = Some(cpu);

        let (kswapd, scanned) = pgscan(&self.proc.vmstat()?);
        let kswapd_active = prev.pgscan_kswapd.map_or(false, |p| kswapd > p);
        let pgscan_delta = prev.pgscan.map_or(0, |p| sub_or_zero(&scanned, &p));
        prev.pgscan_kswapd = Some(kswapd);
        prev.pgscan = Some(scanned);

        let free_swap_pages = self.proc.free_swap_pages()?;

        let running = parse_running(&self.proc.read_loadavg()?)?;
        let sample = ActivitySample {
            cpu_busy,
            kswapd_active,
            free_swap_pages,
            load: running.saturating_sub(1),
            pgscan_delta,
        };

        self.kswapd_active.store(sample.kswapd_active, Ordering::Relaxed);
        self.cpu_idle.store(sample.cpu_busy < self.idle_util, Ordering::Relaxed);
        self.free_swap_pages.store(sample.free_swap_pages, Ordering::Relaxed);
        self.load.store(sample.load, Ordering::Relaxed);
        Ok(sample)
    }
}

impl SystemActivity for ProcActivity {
    fn background_reclaim_active(&self) -> bool {
        self.kswapd_active.load(Ordering::Relaxed)
    }

    fn free_swap_pages(&self) -> u64 {
        self.free_swap_pages.load(Ordering::Relaxed)
    }

    fn cpu_idle(&self) -> bool {
        self.is_idle()
    }

    fn recent_load(&self) -> u64 {
        self.load.load(Ordering::Relaxed)
    }
}
