// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Soft-reclaim primitive over cgroup v2 `memory.reclaim`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use lmk_core::host::ReclaimBackend;
use log::debug;

use crate::proc_host::pgsteal;
use crate::proc_host::ProcHost;

/// Asks the kernel to reclaim from a cgroup (the root one by default) and
/// measures the result as the growth of the `pgsteal_*` counters.
#[derive(Debug)]
pub struct CgroupReclaim {
    path: PathBuf,
    proc: Arc<ProcHost>,
}

impl CgroupReclaim {
    pub fn new<P: Into<PathBuf>>(path: P, proc: Arc<ProcHost>) -> Self {
        Self {
            path: path.into(),
            proc,
        }
    }

    fn pgsteal(&self) -> Result<u64> {
        Ok(pgsteal(&self.proc.vmstat()?))
    }

    fn request(&self, bytes: u64) -> Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {:?}", self.path))?;
        // EAGAIN when the kernel could not reclaim the full amount; the
        // pgsteal delta still tells us what it did get.
        if let Err(e) = f.write_all(bytes.to_string().as_bytes()) {
            if e.raw_os_error() != Some(libc::EAGAIN) {
                return Err(e).with_context(|| format!("Failed to write {:?}", self.path));
            }
        }
        Ok(())
    }

    fn reclaim(&self, nr_pages: u64) -> Result<u64> {
        let before = self.pgsteal()?;
        self.request(nr_pages.saturating_mul(self.proc.page_size()))?;
        let after = self.pgsteal()?;
        Ok(after.saturating_sub(before))
    }
}

impl ReclaimBackend for CgroupReclaim {
    fn reclaim_pages(&self, nr_pages: u64) -> u64 {
        match self.reclaim(nr_pages) {
            Ok(nr) => nr,
            Err(e) => {
                debug!("soft reclaim failed: {:#}", e);
                0
            }
        }
    }
}
