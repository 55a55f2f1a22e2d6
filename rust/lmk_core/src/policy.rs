// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The adj/minfree threshold table.
//!
//! `adj[i]` is the lowest `oom_adj` that becomes killable once the free
//! estimate drops below `minfree[i]` pages. Floors are expected to be in
//! ascending order; the table is only ever replaced as a whole so that a
//! pressure pass always classifies against one consistent snapshot.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use anyhow::anyhow;
use anyhow::Result;

use crate::LOWMEM_ARRAY_MAX;

const DEFAULT_ADJ: [i32; 4] = [0, 1, 6, 12];
const DEFAULT_MINFREE: [u64; 4] = [
    3 * 512,   // 6MB
    2 * 1024,  // 8MB
    4 * 1024,  // 16MB
    16 * 1024, // 64MB
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyTable {
    adj: [i32; LOWMEM_ARRAY_MAX],
    adj_size: usize,
    minfree: [u64; LOWMEM_ARRAY_MAX],
    minfree_size: usize,
}

impl PolicyTable {
    /// Build a table from the two sequences. Each is silently clamped to the
    /// table capacity; their lengths are tracked independently.
    pub fn new(adj: &[i32], minfree: &[u64]) -> Self {
        let mut table = Self {
            adj: [0; LOWMEM_ARRAY_MAX],
            adj_size: 0,
            minfree: [0; LOWMEM_ARRAY_MAX],
            minfree_size: 0,
        };
        table.set_adj(adj);
        table.set_minfree(minfree);
        table
    }

    fn set_adj(&mut self, adj: &[i32]) {
        let n = adj.len().min(LOWMEM_ARRAY_MAX);
        self.adj = [0; LOWMEM_ARRAY_MAX];
        self.adj[..n].copy_from_slice(&adj[..n]);
        self.adj_size = n;
    }

    fn set_minfree(&mut self, minfree: &[u64]) {
        let n = minfree.len().min(LOWMEM_ARRAY_MAX);
        self.minfree = [0; LOWMEM_ARRAY_MAX];
        self.minfree[..n].copy_from_slice(&minfree[..n]);
        self.minfree_size = n;
    }

    /// Copy of this table with the priority thresholds replaced.
    pub fn with_adj(&self, adj: &[i32]) -> Self {
        let mut table = self.clone();
        table.set_adj(adj);
        table
    }

    /// Copy of this table with the free-page floors replaced.
    pub fn with_minfree(&self, minfree: &[u64]) -> Self {
        let mut table = self.clone();
        table.set_minfree(minfree);
        table
    }

    pub fn adj(&self) -> &[i32] {
        &self.adj[..self.adj_size]
    }

    pub fn minfree(&self) -> &[u64] {
        &self.minfree[..self.minfree_size]
    }

    /// Number of (adj, minfree) pairs actually consulted.
    pub fn effective_len(&self) -> usize {
        self.adj_size.min(self.minfree_size)
    }

    pub fn entries(&self) -> impl Iterator<Item = (i32, u64)> + '_ {
        (0..self.effective_len()).map(move |i| (self.adj[i], self.minfree[i]))
    }

    /// Whether the effective floors are non-decreasing. Classification still
    /// works on an unsorted table but the first matching floor wins.
    pub fn floors_sorted(&self) -> bool {
        let n = self.effective_len();
        self.minfree[..n].windows(2).all(|w| w[0] <= w[1])
    }

    /// The priority threshold for the first floor the estimate is below, or
    /// `None` when memory is not low enough for any entry.
    pub fn classify(&self, free_estimate: i64) -> Option<i32> {
        self.entries()
            .find(|&(_, floor)| free_estimate < i64::try_from(floor).unwrap_or(i64::MAX))
            .map(|(adj, _)| adj)
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new(&DEFAULT_ADJ, &DEFAULT_MINFREE)
    }
}

/// Parse a comma separated list such as `"0,1,6,12"`. Whitespace around
/// items is ignored; an empty string is an empty list.
pub fn parse_list<T>(val: &str) -> Result<Vec<T>>
where
    T: FromStr,
{
    let val = val.trim_end_matches('\0').trim();
    if val.is_empty() {
        return Ok(vec![]);
    }
    val.split(',')
        .map(|s| {
            s.trim()
                .parse::<T>()
                .map_err(|_| anyhow!("Failed to parse '{}' in list '{}'", s.trim(), val))
        })
        .collect()
}

/// Render a list the way [`parse_list`] reads it.
pub fn format_list<T: ToString>(vals: &[T]) -> String {
    vals.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// The live policy: readers take a cheap snapshot, writers swap in a new
/// table.
#[derive(Debug)]
pub struct PolicyHandle {
    cur: RwLock<Arc<PolicyTable>>,
}

impl PolicyHandle {
    pub fn new(table: PolicyTable) -> Self {
        Self {
            cur: RwLock::new(Arc::new(table)),
        }
    }

    pub fn load(&self) -> Arc<PolicyTable> {
        self.cur
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Derive the next table from the current one and publish it. Writers
    /// are serialized so that concurrent adj and minfree updates both land.
    pub fn update(&self, f: impl FnOnce(&PolicyTable) -> PolicyTable) -> Arc<PolicyTable> {
        let mut cur = self.cur.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(f(&cur));
        *cur = next.clone();
        next
    }

    pub fn store(&self, table: PolicyTable) -> Arc<PolicyTable> {
        self.update(|_| table)
    }
}
