// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Victims that have been signalled but not reaped yet.
//!
//! A slot holds a process handle (0 when empty) and a debounce deadline.
//! New pressure passes are refused while any slot is occupied and its
//! deadline has not passed. Slots are emptied by the process-exit path with
//! a compare-and-clear on the handle, so an exit notification can never wipe
//! a handle that a newer pass has just stored.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use static_assertions::const_assert;

use crate::clock::duration_to_nanos;
use crate::host::ProcessHandle;
use crate::MAX_VICTIM_SLOTS;

const_assert!(MAX_VICTIM_SLOTS > 0);

const EMPTY: u64 = 0;

#[derive(Debug, Default)]
struct Slot {
    handle: AtomicU64,
    deadline_ns: AtomicU64,
}

#[derive(Debug)]
pub struct DeathPending {
    slots: [Slot; MAX_VICTIM_SLOTS],
    depth: usize,
}

impl DeathPending {
    /// `depth` is clamped to `1..=MAX_VICTIM_SLOTS`.
    pub fn new(depth: usize) -> Self {
        Self {
            slots: Default::default(),
            depth: depth.clamp(1, MAX_VICTIM_SLOTS),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn active(&self) -> &[Slot] {
        &self.slots[..self.depth]
    }

    /// Hold `handle` in slot `idx` until it exits or `deadline` passes.
    /// Overwrites whatever the slot held before.
    pub fn record(&self, idx: usize, handle: ProcessHandle, deadline: Duration) {
        let slot = &self.active()[idx];
        // Deadline first: a reader that sees the new handle also sees its
        // deadline.
        slot.deadline_ns
            .store(duration_to_nanos(deadline), Ordering::Release);
        slot.handle.store(handle.as_raw(), Ordering::Release);
    }

    /// Empty every slot holding `handle`. Returns whether any slot matched.
    pub fn clear_if_matches(&self, handle: ProcessHandle) -> bool {
        let raw = handle.as_raw();
        let mut cleared = false;
        for slot in self.active() {
            if slot
                .handle
                .compare_exchange(raw, EMPTY, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                cleared = true;
            }
        }
        cleared
    }

    /// True while some slot is occupied and `now` has not passed its
    /// deadline.
    pub fn is_blocking(&self, now: Duration) -> bool {
        let now = duration_to_nanos(now);
        self.active().iter().any(|slot| {
            slot.handle.load(Ordering::Acquire) != EMPTY
                && now <= slot.deadline_ns.load(Ordering::Acquire)
        })
    }

    /// Handles currently held, expired or not.
    pub fn held(&self) -> impl Iterator<Item = ProcessHandle> + '_ {
        self.active()
            .iter()
            .filter_map(|slot| ProcessHandle::from_raw(slot.handle.load(Ordering::Acquire)))
    }

    pub fn nr_occupied(&self) -> usize {
        self.held().count()
    }

    pub fn clear_all(&self) {
        for slot in self.active() {
            slot.handle.store(EMPTY, Ordering::Release);
        }
    }
}
