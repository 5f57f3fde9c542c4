//! In-memory commit log.
//!
//! Committed numbers are kept as disjoint, non-adjacent intervals, so memory
//! grows with the number of gaps rather than the number of blocks.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Mutex;

use chainsync_core::{Store, SyncError};

/// In-memory [`Store`]. All data is lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    /// start -> end (inclusive)
    runs: Mutex<BTreeMap<u64, u64>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, block_number: u64) -> bool {
        self.runs
            .lock()
            .map(|runs| {
                runs.range(..=block_number)
                    .next_back()
                    .is_some_and(|(_, &end)| block_number <= end)
            })
            .unwrap_or(false)
    }

    /// Committed ranges, ascending.
    pub fn runs(&self) -> Vec<(u64, u64)> {
        self.runs
            .lock()
            .map(|runs| runs.iter().map(|(&s, &e)| (s, e)).collect())
            .unwrap_or_default()
    }
}

fn insert(runs: &mut BTreeMap<u64, u64>, n: u64) {
    if let Some((_, &end)) = runs.range(..=n).next_back() {
        if n <= end {
            return;
        }
    }

    let mut start = n;
    let mut end = n;
    if let Some((&s, &e)) = runs.range(..n).next_back() {
        if e + 1 == n {
            start = s;
        }
    }
    if let Some(next) = n.checked_add(1) {
        if let Some(e) = runs.remove(&next) {
            end = e;
        }
    }
    runs.insert(start, end);
}

/// Walk the gaps between runs, jumping over each run in one step.
fn missing(runs: &BTreeMap<u64, u64>, range: RangeInclusive<u64>, limit: usize) -> Vec<u64> {
    let (mut next, end) = range.into_inner();
    let mut out = Vec::new();
    while next <= end && out.len() < limit {
        let covering = runs
            .range(..=next)
            .next_back()
            .filter(|&(_, &run_end)| next <= run_end);
        let step = match covering {
            Some((_, &run_end)) => run_end.checked_add(1),
            None => {
                out.push(next);
                next.checked_add(1)
            }
        };
        match step {
            Some(n) => next = n,
            None => break,
        }
    }
    out
}

#[async_trait]
impl Store for InMemoryStore {
    async fn commit_block(&self, block_number: u64) -> Result<(), SyncError> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| SyncError::Store("memory store lock poisoned".into()))?;
        insert(&mut runs, block_number);
        Ok(())
    }

    async fn highest_committed_block(&self) -> Result<Option<u64>, SyncError> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| SyncError::Store("memory store lock poisoned".into()))?;
        Ok(runs.values().next().copied())
    }

    async fn missing_blocks(
        &self,
        range: RangeInclusive<u64>,
        limit: usize,
    ) -> Result<Vec<u64>, SyncError> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| SyncError::Store("memory store lock poisoned".into()))?;
        Ok(missing(&runs, range, limit))
    }
}
