// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Opportunistic reclaim while the system is idle.
//!
//! A request flag is raised by the host or by the guarded trigger command.
//! Every idle notification evaluates the gate; when it opens, the
//! `kcompcached` worker is woken to reclaim a fixed budget of pages. An
//! attempt that recovers less than the effectiveness floor drops the request
//! until it is raised again.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use metrics::counter;
use metrics::Counter;

use crate::clock::duration_to_nanos;
use crate::host::ReclaimBackend;
use crate::params::Tunables;

/// Opaque idle transition reported by the host. Every reason evaluates the
/// gate the same way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleReason {
    Enter,
    Exit,
    Other(u32),
}

/// Outcome of one gate evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateVerdict {
    /// The worker was woken.
    Open,
    /// No worker was started for this instance.
    Disabled,
    Frozen,
    NotRequested,
    /// The minimum interval since the last wake has not elapsed.
    TooSoon,
    /// The selector or the system's background reclaimer is running.
    Busy,
    LowSwap,
    NotIdle,
    AlreadyRunning,
}

impl fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateVerdict::Open => "open",
            GateVerdict::Disabled => "disabled",
            GateVerdict::Frozen => "frozen",
            GateVerdict::NotRequested => "not requested",
            GateVerdict::TooSoon => "too soon",
            GateVerdict::Busy => "busy",
            GateVerdict::LowSwap => "low swap",
            GateVerdict::NotIdle => "not idle",
            GateVerdict::AlreadyRunning => "already running",
        };
        f.write_str(s)
    }
}

/// Snapshot of everything the gate looks at.
#[derive(Clone, Copy, Debug)]
pub struct GateInputs {
    pub frozen: bool,
    pub requested: bool,
    pub now: Duration,
    /// Time of the last wake, or of construction before the first one.
    pub last_wake: Duration,
    pub min_interval: Duration,
    pub selector_running: bool,
    pub background_reclaim: bool,
    pub free_swap_pages: u64,
    pub min_freeswap: u64,
    pub cpu_idle: bool,
    pub recent_load: u64,
    pub worker_running: bool,
}

/// Decide whether the worker may be woken. Conditions are checked in a fixed
/// order and the first failing one is reported.
pub fn evaluate_gate(i: &GateInputs) -> GateVerdict {
    if i.frozen {
        return GateVerdict::Frozen;
    }
    if !i.requested {
        return GateVerdict::NotRequested;
    }
    if i.now < i.last_wake.saturating_add(i.min_interval) {
        return GateVerdict::TooSoon;
    }
    if i.selector_running || i.background_reclaim {
        return GateVerdict::Busy;
    }
    if i.free_swap_pages < i.min_freeswap {
        return GateVerdict::LowSwap;
    }
    if !i.cpu_idle || i.recent_load != 0 {
        return GateVerdict::NotIdle;
    }
    if i.worker_running {
        return GateVerdict::AlreadyRunning;
    }
    GateVerdict::Open
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerError {
    /// Not of the form `<value>,<proof>` with two integers.
    Malformed,
    /// Negative value, or the proof is not `value * value - 1`.
    BadProof,
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerError::Malformed => write!(f, "malformed trigger command"),
            TriggerError::BadProof => write!(f, "invalid trigger proof"),
        }
    }
}

impl std::error::Error for TriggerError {}

/// Validate a `"<value>,<proof>"` trigger command. Returns the value.
pub fn parse_trigger(input: &str) -> Result<i64, TriggerError> {
    let input = input.trim_end_matches('\0').trim();
    let (val, proof) = input.split_once(',').ok_or(TriggerError::Malformed)?;
    let val: i64 = val.trim().parse().map_err(|_| TriggerError::Malformed)?;
    let proof: i64 = proof.trim().parse().map_err(|_| TriggerError::Malformed)?;

    if val < 0 {
        return Err(TriggerError::BadProof);
    }
    match val.checked_mul(val).and_then(|sq| sq.checked_sub(1)) {
        Some(expected) if expected == proof => Ok(val),
        _ => Err(TriggerError::BadProof),
    }
}

#[derive(Debug)]
pub(crate) enum WorkerMsg {
    Wake,
    Stop,
}

pub(crate) fn worker_channel() -> (Sender<WorkerMsg>, Receiver<WorkerMsg>) {
    channel::unbounded()
}

struct Metrics {
    wakeups: Counter,
    pages: Counter,
    cancelled: Counter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            wakeups: counter!("soft_reclaim_wakeups_total"),
            pages: counter!("soft_reclaim_pages_total"),
            cancelled: counter!("soft_reclaim_cancelled_total"),
        }
    }
}

/// Soft-reclaim flags plus the wake channel to the worker.
pub struct SoftReclaim {
    need_to_reclaim: AtomicBool,
    worker_running: AtomicBool,
    frozen: AtomicBool,
    stopping: AtomicBool,
    last_wake_ns: AtomicU64,
    wake_tx: Option<Sender<WorkerMsg>>,

    nr_wakeups: AtomicU64,
    nr_pages: AtomicU64,
    nr_cancelled: AtomicU64,
    metrics: Metrics,
}

impl fmt::Debug for SoftReclaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftReclaim")
            .field("need_to_reclaim", &self.is_requested())
            .field("worker_running", &self.is_running())
            .field("frozen", &self.is_frozen())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl SoftReclaim {
    /// `wake_tx` is `None` when no worker exists; the gate then always
    /// reports [`GateVerdict::Disabled`]. The wake interval counts from
    /// `now`, so the first wake is no earlier than `min_interval` after
    /// construction.
    pub(crate) fn new(wake_tx: Option<Sender<WorkerMsg>>, now: Duration) -> Self {
        Self {
            need_to_reclaim: AtomicBool::new(false),
            worker_running: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            last_wake_ns: AtomicU64::new(duration_to_nanos(now)),
            wake_tx,
            nr_wakeups: AtomicU64::new(0),
            nr_pages: AtomicU64::new(0),
            nr_cancelled: AtomicU64::new(0),
            metrics: Metrics::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.wake_tx.is_some()
    }

    pub fn request(&self) {
        self.need_to_reclaim.store(true, Ordering::Release);
    }

    pub fn cancel(&self) {
        self.need_to_reclaim.store(false, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.need_to_reclaim.load(Ordering::Acquire)
    }

    /// Whether the worker is currently woken or reclaiming.
    pub fn is_running(&self) -> bool {
        self.worker_running.load(Ordering::Acquire)
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn thaw(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn last_wake(&self) -> Duration {
        Duration::from_nanos(self.last_wake_ns.load(Ordering::Acquire))
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn nr_wakeups(&self) -> u64 {
        self.nr_wakeups.load(Ordering::Relaxed)
    }

    pub fn nr_pages(&self) -> u64 {
        self.nr_pages.load(Ordering::Relaxed)
    }

    pub fn nr_cancelled(&self) -> u64 {
        self.nr_cancelled.load(Ordering::Relaxed)
    }

    /// Validate a trigger command and raise the request flag if it passes.
    /// A rejected command leaves the flag untouched.
    pub fn trigger(&self, input: &str) -> Result<(), TriggerError> {
        parse_trigger(input)?;
        self.request();
        Ok(())
    }

    /// Fill in the flag-derived part of the gate inputs. `sample` supplies the
    /// host-derived rest and is skipped entirely when the cheap checks
    /// already close the gate.
    pub(crate) fn try_wake(
        &self,
        now: Duration,
        tunables: &Tunables,
        selector_running: bool,
        sample: impl FnOnce(&mut GateInputs),
    ) -> GateVerdict {
        let tx = match &self.wake_tx {
            Some(tx) if !self.is_stopping() => tx,
            _ => return GateVerdict::Disabled,
        };

        let mut inputs = GateInputs {
            frozen: self.is_frozen(),
            requested: self.is_requested(),
            now,
            last_wake: self.last_wake(),
            min_interval: tunables.min_interval(),
            selector_running,
            background_reclaim: false,
            free_swap_pages: u64::MAX,
            min_freeswap: tunables.min_freeswap(),
            cpu_idle: true,
            recent_load: 0,
            worker_running: self.is_running(),
        };
        let verdict = evaluate_gate(&inputs);
        if verdict != GateVerdict::Open {
            return verdict;
        }

        sample(&mut inputs);
        let verdict = evaluate_gate(&inputs);
        if verdict != GateVerdict::Open {
            return verdict;
        }

        if self
            .worker_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return GateVerdict::AlreadyRunning;
        }
        if tx.send(WorkerMsg::Wake).is_err() {
            self.worker_running.store(false, Ordering::Release);
            log::warn!("kcompcached is gone, soft reclaim unavailable");
            return GateVerdict::Disabled;
        }
        self.last_wake_ns
            .store(duration_to_nanos(now), Ordering::Release);
        self.nr_wakeups.fetch_add(1, Ordering::Relaxed);
        self.metrics.wakeups.increment(1);
        GateVerdict::Open
    }

    /// One worker iteration after a wake. Returns the pages reclaimed, or
    /// `None` if nothing was attempted.
    pub(crate) fn run_once(
        &self,
        backend: &dyn ReclaimBackend,
        tunables: &Tunables,
    ) -> Option<u64> {
        if !self.is_running() {
            return None;
        }
        // A wake queued before stop() must not reach the backend.
        if self.is_stopping() || self.is_frozen() {
            self.worker_running.store(false, Ordering::Release);
            return None;
        }

        let nr_to_reclaim = tunables.nr_reclaim();
        let reclaimed = backend.reclaim_pages(nr_to_reclaim);
        self.nr_pages.fetch_add(reclaimed, Ordering::Relaxed);
        self.metrics.pages.increment(reclaimed);

        if reclaimed < tunables.min_reclaim() {
            self.cancel();
            self.nr_cancelled.fetch_add(1, Ordering::Relaxed);
            self.metrics.cancelled.increment(1);
            lmk_print!(
                tunables,
                3,
                "kcompcached: reclaimed {} of {} pages, below {}, cancelling",
                reclaimed,
                nr_to_reclaim,
                tunables.min_reclaim()
            );
        } else {
            lmk_print!(
                tunables,
                4,
                "kcompcached: reclaimed {} of {} pages",
                reclaimed,
                nr_to_reclaim
            );
        }

        self.worker_running.store(false, Ordering::Release);
        Some(reclaimed)
    }

    /// Body of the `kcompcached` thread: park on the channel, reclaim on
    /// every wake, exit on stop or when every sender is gone.
    pub(crate) fn worker_loop(
        &self,
        rx: &Receiver<WorkerMsg>,
        backend: &dyn ReclaimBackend,
        tunables: &Tunables,
    ) {
        while let Ok(msg) = rx.recv() {
            match msg {
                WorkerMsg::Wake => {
                    self.run_once(backend, tunables);
                }
                WorkerMsg::Stop => break,
            }
        }
        self.worker_running.store(false, Ordering::Release);
    }

    /// Ask the worker to exit. Wakes still queued are dropped without
    /// reclaiming. Safe to call more than once.
    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.cancel();
        if let Some(tx) = &self.wake_tx {
            let _ = tx.send(WorkerMsg::Stop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LmkConfig;
    use std::sync::atomic::AtomicUsize;

    fn open_inputs() -> GateInputs {
        GateInputs {
            frozen: false,
            requested: true,
            now: Duration::from_secs(100),
            last_wake: Duration::from_secs(90),
            min_interval: Duration::from_secs(5),
            selector_running: false,
            background_reclaim: false,
            free_swap_pages: 10000,
            min_freeswap: 8192,
            cpu_idle: true,
            recent_load: 0,
            worker_running: false,
        }
    }

    #[test]
    fn test_gate_conditions() {
        let base = open_inputs();
        assert_eq!(evaluate_gate(&base), GateVerdict::Open);

        let cases = [
            (GateInputs { frozen: true, ..base }, GateVerdict::Frozen),
            (GateInputs { requested: false, ..base }, GateVerdict::NotRequested),
            (
                GateInputs { last_wake: Duration::from_secs(96), ..base },
                GateVerdict::TooSoon,
            ),
            (GateInputs { selector_running: true, ..base }, GateVerdict::Busy),
            (GateInputs { background_reclaim: true, ..base }, GateVerdict::Busy),
            (GateInputs { free_swap_pages: 8191, ..base }, GateVerdict::LowSwap),
            (GateInputs { cpu_idle: false, ..base }, GateVerdict::NotIdle),
            (GateInputs { recent_load: 1, ..base }, GateVerdict::NotIdle),
            (GateInputs { worker_running: true, ..base }, GateVerdict::AlreadyRunning),
        ];
        for (inputs, expected) in cases {
            assert_eq!(evaluate_gate(&inputs), expected, "{:?}", inputs);
        }
    }

    #[test]
    fn test_gate_boundaries() {
        let base = open_inputs();
        // Exactly min_interval after the last wake is allowed.
        let at = GateInputs { last_wake: Duration::from_secs(95), ..base };
        assert_eq!(evaluate_gate(&at), GateVerdict::Open);
        // Freshly started: the interval counts from construction.
        let fresh = GateInputs { last_wake: Duration::ZERO, now: Duration::from_secs(4), ..base };
        assert_eq!(evaluate_gate(&fresh), GateVerdict::TooSoon);
        let fresh = GateInputs { now: Duration::from_secs(5), ..fresh };
        assert_eq!(evaluate_gate(&fresh), GateVerdict::Open);
        // Free swap equal to the floor is enough.
        let swap = GateInputs { free_swap_pages: 8192, ..base };
        assert_eq!(evaluate_gate(&swap), GateVerdict::Open);
    }

    #[test]
    fn test_parse_trigger() {
        assert_eq!(parse_trigger("4,15"), Ok(4));
        assert_eq!(parse_trigger("4,15\n"), Ok(4));
        assert_eq!(parse_trigger("0,-1"), Ok(0));
        assert_eq!(parse_trigger(" 3 , 8 "), Ok(3));

        assert_eq!(parse_trigger("4,16"), Err(TriggerError::BadProof));
        assert_eq!(parse_trigger("-4,15"), Err(TriggerError::BadProof));
        assert_eq!(parse_trigger("4000000000,15999999999999999999"), Err(TriggerError::Malformed));
        assert_eq!(parse_trigger("4000000000,0"), Err(TriggerError::BadProof));

        assert_eq!(parse_trigger(""), Err(TriggerError::Malformed));
        assert_eq!(parse_trigger("4"), Err(TriggerError::Malformed));
        assert_eq!(parse_trigger("a,b"), Err(TriggerError::Malformed));
        assert_eq!(parse_trigger("4,15,1"), Err(TriggerError::Malformed));
    }

    #[test]
    fn test_trigger_sets_flag_only_when_valid() {
        let sr = SoftReclaim::new(None, Duration::ZERO);
        assert!(sr.trigger("4,16").is_err());
        assert!(!sr.is_requested());
        sr.trigger("4,15").unwrap();
        assert!(sr.is_requested());
        sr.cancel();
        assert!(!sr.is_requested());
    }

    struct FixedReclaim {
        pages: u64,
        calls: AtomicUsize,
    }

    impl ReclaimBackend for FixedReclaim {
        fn reclaim_pages(&self, _nr_pages: u64) -> u64 {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.pages
        }
    }

    #[test]
    fn test_wake_and_run_once() {
        let tunables = Tunables::new(&LmkConfig::default());
        let (tx, rx) = worker_channel();
        let sr = SoftReclaim::new(Some(tx), Duration::ZERO);
        let backend = FixedReclaim { pages: 300, calls: AtomicUsize::new(0) };
        let now = Duration::from_secs(5);

        assert_eq!(sr.try_wake(now, &tunables, false, |_| {}), GateVerdict::NotRequested);

        sr.request();
        let verdict = sr.try_wake(now, &tunables, false, |i| i.free_swap_pages = 100_000);
        assert_eq!(verdict, GateVerdict::Open);
        assert!(sr.is_running());
        assert_eq!(sr.last_wake(), now);
        assert!(matches!(rx.try_recv(), Ok(WorkerMsg::Wake)));

        // Still running: a second idle event does not queue another wake.
        let later = Duration::from_secs(100);
        let verdict = sr.try_wake(later, &tunables, false, |i| i.free_swap_pages = 100_000);
        assert_eq!(verdict, GateVerdict::AlreadyRunning);

        assert_eq!(sr.run_once(&backend, &tunables), Some(300));
        assert!(!sr.is_running());
        // 300 >= 256, request stays raised.
        assert!(sr.is_requested());
        assert_eq!(sr.nr_pages(), 300);
        assert_eq!(sr.nr_wakeups(), 1);
    }

    #[test]
    fn test_ineffective_attempt_cancels_request() {
        let tunables = Tunables::new(&LmkConfig::default());
        let (tx, _rx) = worker_channel();
        let sr = SoftReclaim::new(Some(tx), Duration::ZERO);
        let backend = FixedReclaim { pages: 10, calls: AtomicUsize::new(0) };

        sr.request();
        assert_eq!(
            sr.try_wake(Duration::from_secs(5), &tunables, false, |_| {}),
            GateVerdict::Open
        );
        assert_eq!(sr.run_once(&backend, &tunables), Some(10));
        assert!(!sr.is_requested());
        assert_eq!(sr.nr_cancelled(), 1);

        let verdict = sr.try_wake(Duration::from_secs(60), &tunables, false, |_| {});
        assert_eq!(verdict, GateVerdict::NotRequested);
        assert_eq!(backend.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_host_inputs_skipped_when_closed_early() {
        let tunables = Tunables::new(&LmkConfig::default());
        let (tx, _rx) = worker_channel();
        let sr = SoftReclaim::new(Some(tx), Duration::ZERO);
        let now = Duration::from_secs(5);
        let mut sampled = false;
        sr.try_wake(now, &tunables, false, |_| sampled = true);
        assert!(!sampled);

        sr.request();
        assert_eq!(
            sr.try_wake(Duration::from_secs(1), &tunables, false, |_| sampled = true),
            GateVerdict::TooSoon
        );
        assert_eq!(sr.try_wake(now, &tunables, true, |_| sampled = true), GateVerdict::Busy);
        assert!(!sampled);
    }

    #[test]
    fn test_frozen_wake_does_nothing() {
        let tunables = Tunables::new(&LmkConfig::default());
        let (tx, _rx) = worker_channel();
        let sr = SoftReclaim::new(Some(tx), Duration::ZERO);
        let backend = FixedReclaim { pages: 1000, calls: AtomicUsize::new(0) };

        sr.request();
        assert_eq!(
            sr.try_wake(Duration::from_secs(5), &tunables, false, |_| {}),
            GateVerdict::Open
        );
        sr.freeze();
        assert_eq!(sr.run_once(&backend, &tunables), None);
        assert!(!sr.is_running());
        assert_eq!(backend.calls.load(Ordering::Relaxed), 0);

        assert_eq!(
            sr.try_wake(Duration::from_secs(60), &tunables, false, |_| {}),
            GateVerdict::Frozen
        );
        sr.thaw();
        assert_eq!(
            sr.try_wake(Duration::from_secs(60), &tunables, false, |_| {}),
            GateVerdict::Open
        );
    }

    #[test]
    fn test_disabled_and_dead_worker() {
        let tunables = Tunables::new(&LmkConfig::default());
        let sr = SoftReclaim::new(None, Duration::ZERO);
        sr.request();
        assert_eq!(sr.try_wake(Duration::ZERO, &tunables, false, |_| {}), GateVerdict::Disabled);

        let (tx, rx) = worker_channel();
        drop(rx);
        let sr = SoftReclaim::new(Some(tx), Duration::ZERO);
        sr.request();
        assert_eq!(
            sr.try_wake(Duration::from_secs(5), &tunables, false, |_| {}),
            GateVerdict::Disabled
        );
        assert!(!sr.is_running());
    }

    #[test]
    fn test_stop_drops_queued_wake() {
        let tunables = Tunables::new(&LmkConfig::default());
        let (tx, rx) = worker_channel();
        let sr = SoftReclaim::new(Some(tx), Duration::ZERO);
        let backend = FixedReclaim { pages: 1000, calls: AtomicUsize::new(0) };

        sr.request();
        assert_eq!(
            sr.try_wake(Duration::from_secs(5), &tunables, false, |_| {}),
            GateVerdict::Open
        );
        // Stop lands before the worker dequeues the wake.
        sr.stop();
        assert!(sr.is_stopping());
        sr.worker_loop(&rx, &backend, &tunables);

        assert_eq!(backend.calls.load(Ordering::Relaxed), 0);
        assert_eq!(sr.nr_pages(), 0);
        assert!(!sr.is_running());
        assert!(!sr.is_requested());

        // Nothing can be woken afterwards.
        sr.request();
        assert_eq!(
            sr.try_wake(Duration::from_secs(60), &tunables, false, |_| {}),
            GateVerdict::Disabled
        );
    }
}
