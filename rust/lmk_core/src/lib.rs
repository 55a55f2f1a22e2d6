// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Low-memory killer policy core
//!
//! This crate decides, on every memory-pressure notification, whether one or
//! more running processes should be killed to free memory. Userspace
//! specifies a table of priority thresholds and free-memory floors: when the
//! estimated free memory drops below a floor, processes whose priority
//! (`oom_adj`) is at or above the matching threshold become eligible and the
//! highest-priority, largest of them is killed.
//!
//! For example, with `adj = [0, 8]` and `minfree = [1024, 4096]` processes
//! with an `oom_adj` of 8 or higher are killed once free memory drops below
//! 4096 pages, and processes with an `oom_adj` of 0 or higher once it drops
//! below 1024 pages.
//!
//! ## Components
//!
//! - [`PolicyTable`]: the threshold table, swapped wholesale on update.
//! - [`DeathPending`]: victims that have been signalled but not reaped yet,
//!   each with a debounce deadline.
//! - [`Selection`]: bounded top-K victim selection over one process walk.
//! - [`SoftReclaim`]: the idle-time reclaim gate, its request flag and the
//!   `kcompcached` worker.
//! - [`LowMemoryKiller`]: owns all of the above and exposes the pressure,
//!   process-exit, idle and trigger callbacks.
//!
//! Everything the policy needs from the operating system (process walk,
//! memory counters, kill, page reclaim, system activity) is injected through
//! the traits in [`host`].

#[macro_use]
mod debug;

pub mod clock;
pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::MonotonicClock;

pub mod config;
pub use config::LmkConfig;
pub use config::SoftReclaimConfig;

pub mod host;
pub use host::Host;
pub use host::MemoryCounters;
pub use host::ProcessHandle;
pub use host::ProcessInfo;
pub use host::TaskComm;
pub use host::TerminateError;

mod killer;
pub use killer::LowMemoryKiller;
pub use killer::ShrinkControl;

mod params;
pub use params::Params;
pub use params::Tunables;

mod pending;
pub use pending::DeathPending;

pub mod policy;
pub use policy::PolicyTable;

mod select;
pub use select::Candidate;
pub use select::Selection;

pub mod soft_reclaim;
pub use soft_reclaim::GateVerdict;
pub use soft_reclaim::IdleReason;
pub use soft_reclaim::SoftReclaim;
pub use soft_reclaim::TriggerError;

mod stats;
pub use stats::LmkStats;

/// Lowest `oom_adj` value; processes at this value are never eligible.
pub const OOM_DISABLE: i32 = -17;

/// Highest `oom_adj` value.
pub const OOM_ADJUST_MAX: i32 = 15;

/// Highest `oom_score_adj` value.
pub const OOM_SCORE_ADJ_MAX: i32 = 1000;

/// Capacity of the adj/minfree threshold table.
pub const LOWMEM_ARRAY_MAX: usize = 6;

/// Maximum number of victims selected by a single pressure pass.
pub const MAX_VICTIM_SLOTS: usize = 3;

/// Convert an `oom_score_adj` value to the `oom_adj` scale the policy table
/// is expressed in.
pub fn oom_score_adj_to_adj(score_adj: i32) -> i32 {
    if score_adj == OOM_SCORE_ADJ_MAX {
        OOM_ADJUST_MAX
    } else {
        score_adj * -OOM_DISABLE / OOM_SCORE_ADJ_MAX
    }
}
