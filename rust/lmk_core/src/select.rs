// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Victim selection over one walk of the process set.
//!
//! Up to `depth` candidates are kept in fixed slots. Empty slots are filled
//! in encounter order; once all are taken, the weakest held candidate (lowest
//! `oom_adj`, then smallest RSS) is replaced by any newcomer that beats it,
//! and the weakest is recomputed after every replacement. With a depth of one
//! this is simply "keep the best candidate". Nothing here allocates.

use crate::host::ProcessHandle;
use crate::host::ProcessInfo;
use crate::host::ProcessTable;
use crate::host::TaskComm;
use crate::MAX_VICTIM_SLOTS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub handle: ProcessHandle,
    pub comm: TaskComm,
    pub oom_adj: i32,
    pub rss_pages: i64,
}

impl Candidate {
    pub fn from_info(p: &ProcessInfo<'_>) -> Self {
        Self {
            handle: p.handle,
            comm: TaskComm::new(p.comm),
            oom_adj: p.oom_adj,
            rss_pages: p.rss_pages,
        }
    }

    /// Higher `oom_adj` wins; on a tie the larger footprint wins.
    pub fn beats(&self, other: &Candidate) -> bool {
        self.oom_adj > other.oom_adj
            || (self.oom_adj == other.oom_adj && self.rss_pages > other.rss_pages)
    }
}

#[derive(Debug)]
pub struct Selection {
    slots: [Option<Candidate>; MAX_VICTIM_SLOTS],
    depth: usize,
    nr_selected: usize,
    weakest: usize,
}

impl Selection {
    /// `depth` is clamped to `1..=MAX_VICTIM_SLOTS`.
    pub fn new(depth: usize) -> Self {
        Self {
            slots: [None; MAX_VICTIM_SLOTS],
            depth: depth.clamp(1, MAX_VICTIM_SLOTS),
            nr_selected: 0,
            weakest: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.nr_selected
    }

    pub fn is_empty(&self) -> bool {
        self.nr_selected == 0
    }

    /// Offer a candidate. Returns true if it was taken into a slot.
    pub fn offer(&mut self, cand: Candidate) -> bool {
        let idx = if self.nr_selected < self.depth {
            match self.slots[..self.depth].iter().position(Option::is_none) {
                Some(i) => i,
                None => return false,
            }
        } else {
            match &self.slots[self.weakest] {
                Some(weakest) if cand.beats(weakest) => self.weakest,
                _ => return false,
            }
        };

        self.slots[idx] = Some(cand);
        if self.nr_selected < self.depth {
            self.nr_selected += 1;
        }
        if self.nr_selected == self.depth {
            self.recompute_weakest(idx);
        }
        true
    }

    /// Linear rescan starting from the slot just written. Only a strictly
    /// weaker slot moves the index, so among exact ties the slot written
    /// last stays the weakest unless an earlier equal one precedes it in the
    /// rescan.
    fn recompute_weakest(&mut self, start: usize) {
        let mut weakest = start;
        for i in 0..self.depth {
            if let (Some(c), Some(w)) = (&self.slots[i], &self.slots[weakest]) {
                if c.oom_adj < w.oom_adj
                    || (c.oom_adj == w.oom_adj && c.rss_pages < w.rss_pages)
                {
                    weakest = i;
                }
            }
        }
        self.weakest = weakest;
    }

    /// Selected victims with their slot index.
    pub fn victims(&self) -> impl Iterator<Item = (usize, &Candidate)> + '_ {
        self.slots[..self.depth]
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i, c)))
    }

    /// Sum of the selected victims' resident pages.
    pub fn rss_pages(&self) -> i64 {
        self.victims()
            .fold(0i64, |acc, (_, c)| acc.saturating_add(c.rss_pages))
    }
}

/// Whether a walked process may be offered at all for threshold `min_adj`.
pub fn eligible(p: &ProcessInfo<'_>, min_adj: i32) -> bool {
    p.has_mm && p.reapable && p.oom_adj >= min_adj && p.rss_pages > 0
}

/// Walk the process set once and select up to `depth` victims at or above
/// `min_adj`. `on_select` sees every candidate taken into a slot, including
/// ones evicted later in the walk.
pub fn scan(
    processes: &dyn ProcessTable,
    min_adj: i32,
    depth: usize,
    mut on_select: impl FnMut(&Candidate),
) -> Selection {
    let mut sel = Selection::new(depth);
    processes.for_each_live_process(&mut |p| {
        if !eligible(p, min_adj) {
            return;
        }
        let cand = Candidate::from_info(p);
        if sel.offer(cand) {
            on_select(&cand);
        }
    });
    sel
}
