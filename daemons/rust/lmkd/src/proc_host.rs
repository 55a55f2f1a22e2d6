// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host capabilities backed by `/proc`.
//!
//! Everything fb_procfs parses is read through one [`procfs::ProcReader`]
//! rooted at the configured mount. Only the per-process start time and the
//! priority files are read by hand.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::ValueEnum;
use lmk_core::host::MemoryStats;
use lmk_core::host::ProcessTable;
use lmk_core::host::Terminator;
use lmk_core::oom_score_adj_to_adj;
use lmk_core::MemoryCounters;
use lmk_core::ProcessHandle;
use lmk_core::ProcessInfo;
use lmk_core::TerminateError;
use log::warn;

/// Which per-process priority file to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PriorityFile {
    /// `oom_adj`, already on the policy's scale.
    OomAdj,
    /// `oom_score_adj`, converted to the `oom_adj` scale.
    ScoreAdj,
}

pub fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
}

/// Convert the meminfo fields the policy needs into pages.
pub fn counters_from_meminfo(meminfo: &procfs::MemInfo, page_size: u64) -> MemoryCounters {
    let pages = |bytes: Option<u64>| bytes.unwrap_or(0) / page_size;
    MemoryCounters {
        free: pages(meminfo.free),
        // All page-cache pages. meminfo's Cached already leaves out buffers
        // and swap cache.
        file: pages(meminfo.cached) + pages(meminfo.buffers) + pages(meminfo.swap_cached),
        shmem: pages(meminfo.shmem),
        swapcache: pages(meminfo.swap_cached),
        active_anon: pages(meminfo.active_anon),
        inactive_anon: pages(meminfo.inactive_anon),
        active_file: pages(meminfo.active_file),
        inactive_file: pages(meminfo.inactive_file),
    }
}

/// Pages scanned by kswapd and by every reclaimer, in that order.
pub fn pgscan(vmstat: &procfs::VmStat) -> (u64, u64) {
    let kswapd = vmstat.pgscan_kswapd.unwrap_or(0);
    (kswapd, kswapd.saturating_add(vmstat.pgscan_direct.unwrap_or(0)))
}

/// Pages reclaimed by every reclaimer.
pub fn pgsteal(vmstat: &procfs::VmStat) -> u64 {
    vmstat
        .pgsteal_kswapd
        .unwrap_or(0)
        .saturating_add(vmstat.pgsteal_direct.unwrap_or(0))
}

/// Start time of a process in clock ticks since boot, field 22 of
/// `/proc/<pid>/stat`. fb_procfs only reports the derived running time,
/// which moves every second and cannot tell a recycled pid apart.
pub fn parse_start_time(stat: &str) -> Result<u64> {
    // The command name may contain spaces and parentheses.
    let close = stat.rfind(')').ok_or_else(|| anyhow!("No comm in stat"))?;
    stat[close + 1..]
        .split_whitespace()
        .nth(19)
        .ok_or_else(|| anyhow!("No starttime in stat"))?
        .parse::<u64>()
        .context("Invalid starttime in stat")
}

pub fn handle_for(pid: u32, start_time: u64) -> Option<ProcessHandle> {
    ProcessHandle::new(pid, start_time as u32)
}

fn read_trimmed(path: &Path) -> Result<String> {
    let val = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(val.trim_end_matches('\0').trim().to_string())
}

fn is_zombie(stat: &procfs::PidStat) -> bool {
    matches!(stat.state, Some(procfs::PidState::Zombie))
}

/// Everything `lmkd` reads from one procfs mount.
pub struct ProcHost {
    root: PathBuf,
    reader: Mutex<procfs::ProcReader>,
    priority: PriorityFile,
    page_size: u64,
    self_pid: u32,
}

impl std::fmt::Debug for ProcHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcHost")
            .field("root", &self.root)
            .field("priority", &self.priority)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl ProcHost {
    pub fn new<P: Into<PathBuf>>(root: P, priority: PriorityFile) -> Self {
        let root = root.into();
        Self {
            reader: Mutex::new(procfs::ProcReader::new_with_custom_procfs(root.clone())),
            root,
            priority,
            page_size: page_size(),
            self_pid: std::process::id(),
        }
    }

    #[cfg(test)]
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    fn reader(&self) -> MutexGuard<'_, procfs::ProcReader> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn meminfo(&self) -> Result<procfs::MemInfo> {
        self.reader().read_meminfo().context("Failed to read meminfo")
    }

    pub fn vmstat(&self) -> Result<procfs::VmStat> {
        self.reader().read_vmstat().context("Failed to read vmstat")
    }

    pub fn total_cpu(&self) -> Result<procfs::CpuStat> {
        self.reader()
            .read_stat()
            .context("Failed to read stat")?
            .total_cpu
            .ok_or_else(|| anyhow!("Could not read total cpu stat in proc"))
    }

    pub fn read_loadavg(&self) -> Result<String> {
        read_trimmed(&self.root.join("loadavg"))
    }

    pub fn free_swap_pages(&self) -> Result<u64> {
        Ok(self.meminfo()?.swap_free.unwrap_or(0) / self.page_size)
    }

    fn pid_stat(&self, pid: u32) -> Result<procfs::PidStat> {
        self.reader()
            .read_pid_stat(pid)
            .with_context(|| format!("Failed to read stat of {}", pid))
    }

    fn start_time(&self, pid: u32) -> Result<u64> {
        parse_start_time(&read_trimmed(&self.root.join(pid.to_string()).join("stat"))?)
    }

    fn oom_adj(&self, pid: u32) -> Result<i32> {
        let dir = self.root.join(pid.to_string());
        match self.priority {
            PriorityFile::OomAdj => Ok(read_trimmed(&dir.join("oom_adj"))?.parse()?),
            PriorityFile::ScoreAdj => {
                let score: i32 = read_trimmed(&dir.join("oom_score_adj"))?.parse()?;
                Ok(oom_score_adj_to_adj(score))
            }
        }
    }

    /// Whether the process `handle` names still exists with the same start
    /// time and has not exited into a zombie.
    pub fn is_alive(&self, handle: ProcessHandle) -> bool {
        let pid = handle.pid();
        match (self.start_time(pid), self.pid_stat(pid)) {
            (Ok(start), Ok(stat)) => handle_for(pid, start) == Some(handle) && !is_zombie(&stat),
            _ => false,
        }
    }

    fn pids(&self) -> Vec<u32> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list {:?}: {}", self.root, e);
                return vec![];
            }
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
            .collect()
    }

    fn visit_pid(&self, pid: u32, visit: &mut dyn FnMut(&ProcessInfo<'_>)) -> Result<()> {
        let stat = self.pid_stat(pid)?;
        let start = self.start_time(pid)?;
        let handle = handle_for(pid, start).ok_or_else(|| anyhow!("pid 0"))?;
        let oom_adj = self.oom_adj(pid)?;
        let rss_pages = stat.rss_bytes.unwrap_or(0) / self.page_size;

        visit(&ProcessInfo {
            handle,
            comm: stat.comm.as_deref().unwrap_or(""),
            oom_adj,
            rss_pages: i64::try_from(rss_pages).unwrap_or(i64::MAX),
            // Kernel threads have no address space and never any resident
            // pages.
            has_mm: rss_pages > 0 && !is_zombie(&stat),
            reapable: pid != 1 && pid != self.self_pid,
        });
        Ok(())
    }
}

impl ProcessTable for ProcHost {
    fn for_each_live_process(&self, visit: &mut dyn FnMut(&ProcessInfo<'_>)) {
        for pid in self.pids() {
            // Processes exit under our feet all the time; skip them.
            let _ = self.visit_pid(pid, visit);
        }
    }
}

impl MemoryStats for ProcHost {
    fn counters(&self) -> MemoryCounters {
        match self.meminfo() {
            Ok(meminfo) => counters_from_meminfo(&meminfo, self.page_size),
            Err(e) => {
                warn!("{:#}", e);
                MemoryCounters::default()
            }
        }
    }
}

/// Sends `SIGKILL` after re-checking that the pid was not recycled.
#[derive(Debug)]
pub struct ProcKiller {
    host: std::sync::Arc<ProcHost>,
}

impl ProcKiller {
    pub fn new(host: std::sync::Arc<ProcHost>) -> Self {
        Self { host }
    }
}

impl Terminator for ProcKiller {
    fn terminate(&self, victim: ProcessHandle) -> Result<(), TerminateError> {
        if !self.host.is_alive(victim) {
            return Err(TerminateError::Gone);
        }
        let pid = libc::pid_t::try_from(victim.pid()).map_err(|_| TerminateError::Gone)?;
        // SAFETY: kill() has no memory-safety preconditions.
        let ret = unsafe { libc::kill(pid, libc::SIGKILL) };
        if ret == 0 {
            return Ok(());
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => Err(TerminateError::Gone),
            Some(libc::EPERM) => Err(TerminateError::Denied),
            Some(errno) => Err(TerminateError::Other(errno)),
            None => Err(TerminateError::Other(0)),
        }
    }
}
