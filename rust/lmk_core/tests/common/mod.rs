// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! In-memory host for driving `LowMemoryKiller` end to end.

#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use lmk_core::host::MemoryStats;
use lmk_core::host::ProcessTable;
use lmk_core::host::ReclaimBackend;
use lmk_core::host::SystemActivity;
use lmk_core::host::Terminator;
use lmk_core::Host;
use lmk_core::LmkConfig;
use lmk_core::LowMemoryKiller;
use lmk_core::ManualClock;
use lmk_core::MemoryCounters;
use lmk_core::ProcessHandle;
use lmk_core::ProcessInfo;
use lmk_core::TerminateError;

#[derive(Clone, Debug)]
pub struct FakeProc {
    pub handle: ProcessHandle,
    pub comm: String,
    pub oom_adj: i32,
    pub rss_pages: i64,
    pub has_mm: bool,
    pub reapable: bool,
}

pub fn proc_(pid: u32, oom_adj: i32, rss_pages: i64) -> FakeProc {
    FakeProc {
        handle: ProcessHandle::new(pid, 1).unwrap(),
        comm: format!("app{}", pid),
        oom_adj,
        rss_pages,
        has_mm: true,
        reapable: true,
    }
}

#[derive(Default)]
pub struct FakeProcs {
    pub procs: Mutex<Vec<FakeProc>>,
}

impl ProcessTable for FakeProcs {
    fn for_each_live_process(&self, visit: &mut dyn FnMut(&ProcessInfo<'_>)) {
        let procs = self.procs.lock().unwrap();
        for p in procs.iter() {
            visit(&ProcessInfo {
                handle: p.handle,
                comm: &p.comm,
                oom_adj: p.oom_adj,
                rss_pages: p.rss_pages,
                has_mm: p.has_mm,
                reapable: p.reapable,
            });
        }
    }
}

#[derive(Default)]
pub struct FakeMemory {
    pub counters: Mutex<MemoryCounters>,
}

impl MemoryStats for FakeMemory {
    fn counters(&self) -> MemoryCounters {
        *self.counters.lock().unwrap()
    }
}

pub struct FakeTerminator {
    pub killed: Mutex<Vec<ProcessHandle>>,
    pub result: Mutex<Result<(), TerminateError>>,
}

impl Default for FakeTerminator {
    fn default() -> Self {
        Self {
            killed: Mutex::new(vec![]),
            result: Mutex::new(Ok(())),
        }
    }
}

impl Terminator for FakeTerminator {
    fn terminate(&self, victim: ProcessHandle) -> Result<(), TerminateError> {
        self.killed.lock().unwrap().push(victim);
        *self.result.lock().unwrap()
    }
}

#[derive(Default)]
pub struct FakeReclaim {
    pub pages: AtomicU64,
    pub calls: AtomicUsize,
    pub requested: AtomicU64,
}

impl ReclaimBackend for FakeReclaim {
    fn reclaim_pages(&self, nr_pages: u64) -> u64 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.store(nr_pages, Ordering::SeqCst);
        self.pages.load(Ordering::SeqCst)
    }
}

pub struct FakeActivity {
    pub kswapd: AtomicBool,
    pub free_swap: AtomicU64,
    pub idle: AtomicBool,
    pub load: AtomicU64,
}

impl Default for FakeActivity {
    fn default() -> Self {
        Self {
            kswapd: AtomicBool::new(false),
            free_swap: AtomicU64::new(1 << 20),
            idle: AtomicBool::new(true),
            load: AtomicU64::new(0),
        }
    }
}

impl SystemActivity for FakeActivity {
    fn background_reclaim_active(&self) -> bool {
        self.kswapd.load(Ordering::SeqCst)
    }

    fn free_swap_pages(&self) -> u64 {
        self.free_swap.load(Ordering::SeqCst)
    }

    fn cpu_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    fn recent_load(&self) -> u64 {
        self.load.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct World {
    pub procs: Arc<FakeProcs>,
    pub memory: Arc<FakeMemory>,
    pub terminator: Arc<FakeTerminator>,
    pub reclaim: Arc<FakeReclaim>,
    pub activity: Arc<FakeActivity>,
    pub clock: Arc<ManualClock>,
}

impl World {
    pub fn new() -> Self {
        let world = Self::default();
        // Start away from zero so deadlines are distinguishable.
        world.clock.set(Duration::from_secs(100));
        world
    }

    pub fn host(&self) -> Host {
        Host {
            processes: self.procs.clone(),
            memory: self.memory.clone(),
            terminator: self.terminator.clone(),
            reclaim: self.reclaim.clone(),
            activity: self.activity.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn lmk(&self, config: &LmkConfig) -> LowMemoryKiller {
        LowMemoryKiller::new(config, self.host()).unwrap()
    }

    pub fn add(&self, p: FakeProc) {
        self.procs.procs.lock().unwrap().push(p);
    }

    pub fn remove(&self, handle: ProcessHandle) {
        self.procs.procs.lock().unwrap().retain(|p| p.handle != handle);
    }

    /// Free estimate `free` pages, reclaimable estimate `lru` pages.
    pub fn set_memory(&self, free: u64, lru: u64) {
        *self.memory.counters.lock().unwrap() = MemoryCounters {
            free,
            active_anon: lru,
            ..Default::default()
        };
    }

    pub fn killed(&self) -> Vec<ProcessHandle> {
        self.terminator.killed.lock().unwrap().clone()
    }

    pub fn killed_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.killed().iter().map(|h| h.pid()).collect();
        pids.sort();
        pids
    }
}

/// Config with soft reclaim off so no worker thread is involved.
pub fn lmk_only() -> LmkConfig {
    let mut config = LmkConfig::default();
    config.soft_reclaim.enabled = false;
    config
}

/// Poll until `cond` holds or a few seconds pass.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
