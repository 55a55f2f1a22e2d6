// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;

use anyhow::Result;

use crate::host::ProcessHandle;

/// Point-in-time counters of a [`LowMemoryKiller`](crate::LowMemoryKiller).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LmkStats {
    /// Pressure passes that walked the process set.
    pub nr_scans: u64,
    pub nr_kills: u64,
    /// Pressure passes refused because a victim was still pending.
    pub nr_debounced: u64,
    pub nr_terminate_errors: u64,

    pub nr_reclaim_wakeups: u64,
    pub nr_reclaim_pages: u64,
    pub nr_reclaim_cancelled: u64,

    pub pending: Vec<ProcessHandle>,
    pub reclaim_requested: bool,
    pub reclaim_running: bool,
    pub frozen: bool,
}

fn flag(b: bool) -> char {
    if b {
        'Y'
    } else {
        'N'
    }
}

impl LmkStats {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "lmk: scans={:6} kills={:5} debounced={:6} term_err={}",
            self.nr_scans, self.nr_kills, self.nr_debounced, self.nr_terminate_errors,
        )?;
        writeln!(
            w,
            "soft_reclaim: wakeups={:5} pages={:8} cancelled={:4} req={} run={} frozen={}",
            self.nr_reclaim_wakeups,
            self.nr_reclaim_pages,
            self.nr_reclaim_cancelled,
            flag(self.reclaim_requested),
            flag(self.reclaim_running),
            flag(self.frozen),
        )?;
        if !self.pending.is_empty() {
            let pids: Vec<String> = self.pending.iter().map(|h| h.to_string()).collect();
            writeln!(w, "  pending={}", pids.join(","))?;
        }
        Ok(())
    }
}
