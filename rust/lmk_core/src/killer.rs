// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;

use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;
use metrics::counter;
use metrics::gauge;
use metrics::Counter;
use metrics::Gauge;

use crate::config::LmkConfig;
use crate::host::Host;
use crate::host::ProcessHandle;
use crate::host::TerminateError;
use crate::params::Params;
use crate::params::Tunables;
use crate::pending::DeathPending;
use crate::policy::PolicyHandle;
use crate::policy::PolicyTable;
use crate::select;
use crate::soft_reclaim::worker_channel;
use crate::soft_reclaim::GateVerdict;
use crate::soft_reclaim::IdleReason;
use crate::soft_reclaim::SoftReclaim;
use crate::soft_reclaim::TriggerError;
use crate::stats::LmkStats;
use crate::OOM_ADJUST_MAX;

/// Arguments of one memory-pressure callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShrinkControl {
    /// Scan budget. Zero or negative only asks for the estimate.
    pub nr_to_scan: i64,
    /// Allocation-class hint, reported in diagnostics only.
    pub gfp_mask: u32,
}

impl ShrinkControl {
    pub fn query() -> Self {
        Self::default()
    }

    pub fn scan(nr_to_scan: i64) -> Self {
        Self {
            nr_to_scan,
            gfp_mask: 0,
        }
    }
}

struct Metrics {
    scans: Counter,
    kills: Counter,
    debounced: Counter,
    terminate_errors: Counter,
    pending_victims: Gauge,
}

impl Metrics {
    fn new() -> Self {
        Self {
            scans: counter!("lmk_scans_total"),
            kills: counter!("lmk_kills_total"),
            debounced: counter!("lmk_debounced_total"),
            terminate_errors: counter!("lmk_terminate_errors_total"),
            pending_victims: gauge!("lmk_pending_victims"),
        }
    }
}

#[derive(Default)]
struct Counters {
    nr_scans: AtomicU64,
    nr_kills: AtomicU64,
    nr_debounced: AtomicU64,
    nr_terminate_errors: AtomicU64,
}

struct Shared {
    policy: PolicyHandle,
    tunables: Tunables,
    pending: DeathPending,
    /// Held for the duration of a process walk.
    scanning: AtomicBool,
    soft: SoftReclaim,
    host: Host,
    detached: AtomicBool,
    counters: Counters,
    metrics: Metrics,
}

impl Shared {
    fn update_pending_gauge(&self) {
        self.metrics
            .pending_victims
            .set(self.pending.nr_occupied() as f64);
    }
}

/// The low-memory killer and its soft-reclaim coordinator.
///
/// All callbacks take `&self` and may be called concurrently from any
/// thread. After [`shutdown`](Self::shutdown) every callback is a no-op.
pub struct LowMemoryKiller {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LowMemoryKiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowMemoryKiller")
            .field("policy", &self.shared.policy.load())
            .field("victim_slots", &self.shared.pending.depth())
            .field("soft_reclaim", &self.shared.soft)
            .finish_non_exhaustive()
    }
}

impl LowMemoryKiller {
    pub fn new(config: &LmkConfig, host: Host) -> Result<Self> {
        config.validate()?;

        let table = PolicyTable::new(&config.adj, &config.minfree);
        if !table.floors_sorted() {
            warn!("minfree floors are not ascending: {:?}", table.minfree());
        }

        let (wake_tx, wake_rx) = if config.soft_reclaim.enabled {
            let (tx, rx) = worker_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let shared = Arc::new(Shared {
            policy: PolicyHandle::new(table),
            tunables: Tunables::new(config),
            pending: DeathPending::new(config.victim_slots),
            scanning: AtomicBool::new(false),
            soft: SoftReclaim::new(wake_tx, host.clock.now()),
            host,
            detached: AtomicBool::new(false),
            counters: Counters::default(),
            metrics: Metrics::new(),
        });

        let worker = match wake_rx {
            Some(rx) => {
                let worker_shared = shared.clone();
                let handle = thread::Builder::new()
                    .name("kcompcached".into())
                    .spawn(move || {
                        let s = &*worker_shared;
                        s.soft.worker_loop(&rx, &*s.host.reclaim, &s.tunables);
                    })
                    .context("Failed to spawn kcompcached")?;
                Some(handle)
            }
            None => None,
        };

        info!(
            "lmk: adj={:?} minfree={:?} victim_slots={} soft_reclaim={}",
            shared.policy.load().adj(),
            shared.policy.load().minfree(),
            shared.pending.depth(),
            worker.is_some(),
        );

        Ok(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::Acquire)
    }

    /// Memory-pressure callback. Returns the remaining reclaimable estimate
    /// in pages, reduced by the footprint of any victims signalled by this
    /// pass.
    pub fn on_pressure(&self, sc: ShrinkControl) -> i64 {
        if self.is_detached() {
            return 0;
        }
        let s = &*self.shared;
        let t = &s.tunables;

        let mc = s.host.memory.counters();
        let mut rem = mc.reclaimable_estimate();
        let free = mc.free_estimate();
        let now = s.host.clock.now();

        if s.pending.is_blocking(now) {
            // Size queries are not scans and are not debounced.
            if sc.nr_to_scan > 0 {
                s.counters.nr_debounced.fetch_add(1, Ordering::Relaxed);
                s.metrics.debounced.increment(1);
            }
            lmk_print!(
                t,
                5,
                "lowmem_shrink {}, {:x}, victim pending, return {}",
                sc.nr_to_scan,
                sc.gfp_mask,
                rem
            );
            return rem;
        }

        let table = s.policy.load();
        let min_adj = table.classify(free).unwrap_or(OOM_ADJUST_MAX + 1);

        if sc.nr_to_scan > 0 {
            lmk_print!(
                t,
                3,
                "lowmem_shrink {}, {:x}, ofree {} {}, ma {}",
                sc.nr_to_scan,
                sc.gfp_mask,
                mc.free,
                mc.other_file(),
                min_adj
            );
        }
        if sc.nr_to_scan <= 0 || min_adj == OOM_ADJUST_MAX + 1 {
            lmk_print!(
                t,
                5,
                "lowmem_shrink {}, {:x}, return {}",
                sc.nr_to_scan,
                sc.gfp_mask,
                rem
            );
            return rem;
        }

        if s
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            lmk_print!(
                t,
                5,
                "lowmem_shrink {}, {:x}, scan in flight, return {}",
                sc.nr_to_scan,
                sc.gfp_mask,
                rem
            );
            return rem;
        }
        // A scan that finished between our first check and the flag may have
        // just recorded victims.
        if s.pending.is_blocking(now) {
            s.scanning.store(false, Ordering::Release);
            s.counters.nr_debounced.fetch_add(1, Ordering::Relaxed);
            s.metrics.debounced.increment(1);
            return rem;
        }
        s.counters.nr_scans.fetch_add(1, Ordering::Relaxed);
        s.metrics.scans.increment(1);

        let sel = select::scan(&*s.host.processes, min_adj, s.pending.depth(), |c| {
            lmk_print!(
                t,
                2,
                "select {} ({}), adj {}, size {}, to kill",
                c.handle,
                c.comm,
                c.oom_adj,
                c.rss_pages
            );
        });

        let deadline = now.saturating_add(t.timeout());
        for (idx, victim) in sel.victims() {
            lmk_print!(
                t,
                1,
                "send sigkill to {} ({}), adj {}, size {}",
                victim.handle,
                victim.comm,
                victim.oom_adj,
                victim.rss_pages
            );
            s.pending.record(idx, victim.handle, deadline);
            match s.host.terminator.terminate(victim.handle) {
                Ok(()) => {}
                Err(TerminateError::Gone) => {
                    // Reaped before we got to it; nothing to wait for.
                    s.pending.clear_if_matches(victim.handle);
                }
                Err(e) => {
                    s.counters.nr_terminate_errors.fetch_add(1, Ordering::Relaxed);
                    s.metrics.terminate_errors.increment(1);
                    warn!("Failed to kill {} ({}): {}", victim.handle, victim.comm, e);
                }
            }
            s.counters.nr_kills.fetch_add(1, Ordering::Relaxed);
            s.metrics.kills.increment(1);
            rem = rem.saturating_sub(victim.rss_pages);
        }
        s.update_pending_gauge();

        lmk_print!(
            t,
            4,
            "lowmem_shrink {}, {:x}, return {}",
            sc.nr_to_scan,
            sc.gfp_mask,
            rem
        );
        s.scanning.store(false, Ordering::Release);
        rem
    }

    /// Process-exit notification. Called for every exiting process; frees
    /// any victim slot holding it.
    pub fn on_process_exit(&self, handle: ProcessHandle) {
        if self.is_detached() {
            return;
        }
        let s = &*self.shared;
        if s.pending.clear_if_matches(handle) {
            lmk_print!(s.tunables, 3, "victim {} exited", handle);
            s.update_pending_gauge();
        }
    }

    /// Idle notification. Wakes the soft-reclaim worker if the gate opens.
    pub fn on_idle(&self, reason: IdleReason) -> GateVerdict {
        if self.is_detached() {
            return GateVerdict::Disabled;
        }
        let s = &*self.shared;
        let activity = &s.host.activity;
        let verdict = s.soft.try_wake(
            s.host.clock.now(),
            &s.tunables,
            s.scanning.load(Ordering::Acquire),
            |i| {
                i.background_reclaim = activity.background_reclaim_active();
                i.free_swap_pages = activity.free_swap_pages();
                i.cpu_idle = activity.cpu_idle();
                i.recent_load = activity.recent_load();
            },
        );
        lmk_print!(s.tunables, 5, "idle {:?}: soft reclaim gate {}", reason, verdict);
        verdict
    }

    /// Guarded `"<value>,<proof>"` command that requests soft reclaim.
    pub fn trigger(&self, input: &str) -> Result<(), TriggerError> {
        if self.is_detached() {
            return Ok(());
        }
        self.shared.soft.trigger(input).map_err(|e| {
            warn!("Invalid command: {}", e);
            e
        })
    }

    pub fn need_soft_reclaim(&self) {
        if !self.is_detached() {
            self.shared.soft.request();
        }
    }

    pub fn cancel_soft_reclaim(&self) {
        self.shared.soft.cancel();
    }

    /// Whether the soft-reclaim worker is currently running.
    pub fn soft_reclaim_status(&self) -> bool {
        self.shared.soft.is_running()
    }

    pub fn freeze(&self) {
        self.shared.soft.freeze();
    }

    pub fn thaw(&self) {
        self.shared.soft.thaw();
    }

    pub fn params(&self) -> Params<'_> {
        Params::new(&self.shared.policy, &self.shared.tunables)
    }

    pub fn policy(&self) -> Arc<PolicyTable> {
        self.shared.policy.load()
    }

    /// Reclaim-pressure weight for the host's shrinker accounting.
    pub fn cost(&self) -> i32 {
        self.shared.tunables.cost()
    }

    /// Victims signalled but not yet reported as exited.
    pub fn pending_victims(&self) -> Vec<ProcessHandle> {
        self.shared.pending.held().collect()
    }

    pub fn stats(&self) -> LmkStats {
        let s = &*self.shared;
        let c = &s.counters;
        LmkStats {
            nr_scans: c.nr_scans.load(Ordering::Relaxed),
            nr_kills: c.nr_kills.load(Ordering::Relaxed),
            nr_debounced: c.nr_debounced.load(Ordering::Relaxed),
            nr_terminate_errors: c.nr_terminate_errors.load(Ordering::Relaxed),
            nr_reclaim_wakeups: s.soft.nr_wakeups(),
            nr_reclaim_pages: s.soft.nr_pages(),
            nr_reclaim_cancelled: s.soft.nr_cancelled(),
            pending: self.pending_victims(),
            reclaim_requested: s.soft.is_requested(),
            reclaim_running: s.soft.is_running(),
            frozen: s.soft.is_frozen(),
        }
    }

    /// Detach from all callbacks, stop and join the worker and drop every
    /// pending victim. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shared.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.soft.stop();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                warn!("kcompcached panicked");
            }
        }

        self.shared.pending.clear_all();
        self.shared.update_pending_gauge();
        info!("lmk: shut down");
    }
}

impl Drop for LowMemoryKiller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
