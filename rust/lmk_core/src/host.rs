// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Capabilities the policy borrows from the operating system.
//!
//! The core never enumerates processes, reads memory counters, sends signals
//! or reclaims pages itself. A host (the kernel glue, or `lmkd` on a stock
//! Linux system) implements the traits below and hands them over in a
//! [`Host`] bundle.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

use crate::clock::Clock;

/// Identity of a live process: pid plus a generation value that changes when
/// the pid is recycled. Never zero, so a slot can store "empty" as 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessHandle(NonZeroU64);

impl ProcessHandle {
    /// Returns `None` only for pid 0 with generation 0.
    pub fn new(pid: u32, generation: u32) -> Option<Self> {
        Self::from_raw(((generation as u64) << 32) | pid as u64)
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_raw(self) -> u64 {
        self.0.get()
    }

    pub fn pid(self) -> u32 {
        self.0.get() as u32
    }

    pub fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pid())
    }
}

const TASK_COMM_LEN: usize = 16;

/// Fixed-size copy of a task's command name, so that victims can be reported
/// after the process walk without allocating.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskComm {
    buf: [u8; TASK_COMM_LEN],
    len: u8,
}

impl TaskComm {
    /// Truncates to 15 bytes (the kernel's limit), backing off to a char
    /// boundary.
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(TASK_COMM_LEN - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut buf = [0u8; TASK_COMM_LEN];
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            buf,
            len: len as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }
}

impl Default for TaskComm {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Display for TaskComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for TaskComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// One entry of the live process set as seen during a walk. Only valid for
/// the duration of the visitor call.
#[derive(Clone, Copy, Debug)]
pub struct ProcessInfo<'a> {
    pub handle: ProcessHandle,
    pub comm: &'a str,
    /// Priority on the `oom_adj` scale; higher is killed first.
    pub oom_adj: i32,
    pub rss_pages: i64,
    /// False for kernel threads and tasks whose address space is gone.
    pub has_mm: bool,
    /// False for tasks that must never be selected (init, the host itself).
    pub reapable: bool,
}

/// System-wide page counters sampled at the start of a pressure pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    pub free: u64,
    pub file: u64,
    pub shmem: u64,
    /// Pages held by the swap cache of a compressed swap device. Zero when
    /// there is no such device.
    pub swapcache: u64,
    pub active_anon: u64,
    pub inactive_anon: u64,
    pub active_file: u64,
    pub inactive_file: u64,
}

fn pages(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl MemoryCounters {
    /// File pages that can be dropped: file-backed minus shared memory minus
    /// swap cache.
    pub fn other_file(&self) -> i64 {
        pages(self.file)
            .saturating_sub(pages(self.shmem))
            .saturating_sub(pages(self.swapcache))
    }

    /// Free memory as the policy table sees it.
    pub fn free_estimate(&self) -> i64 {
        pages(self.free).saturating_add(self.other_file())
    }

    /// Pages the general reclaimer could still recover: the four LRU lists.
    pub fn reclaimable_estimate(&self) -> i64 {
        pages(self.active_anon)
            .saturating_add(pages(self.inactive_anon))
            .saturating_add(pages(self.active_file))
            .saturating_add(pages(self.inactive_file))
    }
}

/// Why a kill request did not go through. All variants are tolerated by the
/// caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminateError {
    /// The process already exited or its pid was recycled.
    Gone,
    /// The host is not allowed to signal the process.
    Denied,
    /// Any other failure, carrying the host's error code.
    Other(i32),
}

impl fmt::Display for TerminateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminateError::Gone => write!(f, "process already gone"),
            TerminateError::Denied => write!(f, "permission denied"),
            TerminateError::Other(code) => write!(f, "terminate failed (error {})", code),
        }
    }
}

impl std::error::Error for TerminateError {}

/// Read-side access to the live process set.
pub trait ProcessTable: Send + Sync {
    /// Call `visit` once for every live process while holding whatever
    /// read-side protection the host needs. Processes that disappear during
    /// the walk may simply be skipped. Must not call back into the policy.
    fn for_each_live_process(&self, visit: &mut dyn FnMut(&ProcessInfo<'_>));
}

pub trait MemoryStats: Send + Sync {
    fn counters(&self) -> MemoryCounters;
}

pub trait Terminator: Send + Sync {
    /// Ask the process to die. Must not block.
    fn terminate(&self, victim: ProcessHandle) -> Result<(), TerminateError>;
}

pub trait ReclaimBackend: Send + Sync {
    /// Try to reclaim up to `nr_pages` pages. Returns the number of pages
    /// actually reclaimed. May block; only called from the soft-reclaim
    /// worker.
    fn reclaim_pages(&self, nr_pages: u64) -> u64;
}

/// Probes consulted by the soft-reclaim gate on every idle notification.
pub trait SystemActivity: Send + Sync {
    /// The system's own background page reclaimer is currently running.
    fn background_reclaim_active(&self) -> bool;

    /// Free pages left on the compressed swap device.
    fn free_swap_pages(&self) -> u64;

    /// The CPU the worker would run on has nothing else to do.
    fn cpu_idle(&self) -> bool;

    /// Recent short-term load, zero when nothing else is runnable.
    fn recent_load(&self) -> u64;
}

/// Everything the policy needs from its host.
#[derive(Clone)]
pub struct Host {
    pub processes: Arc<dyn ProcessTable>,
    pub memory: Arc<dyn MemoryStats>,
    pub terminator: Arc<dyn Terminator>,
    pub reclaim: Arc<dyn ReclaimBackend>,
    pub activity: Arc<dyn SystemActivity>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}
