// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory cluster simulator.
//!
//! Backs development (`mem:` urls) and every test that needs a store. The
//! simulator models the pieces of a partitioned KV store the exporter
//! observes: ordered contents, shard boundaries with replica addresses, and
//! the per-transaction read window. The window is modeled as a read budget
//! rather than wall-clock time so tests can trigger `TxnTooOld` at exact
//! positions.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;

use crate::{Database, KeyRange, KeyValue, KvStream, RangeOptions, StoreError, Transaction};

/// One shard: boundary key plus the replica addresses holding it.
#[derive(Debug, Clone)]
pub struct Shard {
    pub begin: Bytes,
    pub addresses: Vec<String>,
}

#[derive(Default)]
struct MemInner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    shards: Vec<Shard>,
    /// One-shot read budgets handed to transactions in creation order.
    fault_plan: VecDeque<usize>,
    /// Budget applied to every transaction once the plan is exhausted.
    default_budget: Option<usize>,
    /// When set, range reads fail with a non-retryable error after this
    /// many rows. Models a storage server going away mid-export.
    hard_fault_after: Option<usize>,
}

/// Shared in-memory store handle. Clones refer to the same contents.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<MemInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.inner.lock().data.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().data.is_empty()
    }

    /// Replace the shard layout. Shards must be given in boundary-key order;
    /// a store with contents should have its first shard begin at `""`.
    pub fn set_shards(&self, shards: Vec<Shard>) {
        self.inner.lock().shards = shards;
    }

    /// Convenience: one shard spanning the whole keyspace.
    pub fn single_shard(&self, addresses: Vec<String>) {
        self.set_shards(vec![Shard {
            begin: Bytes::new(),
            addresses,
        }]);
    }

    /// Every transaction created from now on fails with `TxnTooOld` after
    /// reading `budget` rows.
    pub fn fail_after_reads(&self, budget: usize) {
        self.inner.lock().default_budget = Some(budget);
    }

    /// Queue a one-shot read budget for the next transaction created;
    /// queued budgets are consumed in order before `fail_after_reads`
    /// applies.
    pub fn push_fault(&self, budget: usize) {
        self.inner.lock().fault_plan.push_back(budget);
    }

    /// Every transaction fails with a non-retryable error after reading
    /// `budget` rows.
    pub fn fail_hard_after_reads(&self, budget: usize) {
        self.inner.lock().hard_fault_after = Some(budget);
    }
}

#[async_trait]
impl Database for MemStore {
    async fn create_transaction(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let (budget, hard_fault_after) = {
            let mut inner = self.inner.lock();
            (
                inner.fault_plan.pop_front().or(inner.default_budget),
                inner.hard_fault_after,
            )
        };
        Ok(Box::new(MemTransaction {
            inner: Arc::clone(&self.inner),
            budget,
            hard_fault_after,
            reads: 0,
        }))
    }

    async fn boundary_keys(
        &self,
        range: KeyRange,
        limit: usize,
    ) -> Result<Vec<Bytes>, StoreError> {
        if range.begin > range.end {
            return Err(StoreError::InvalidRange(range.to_string()));
        }
        let inner = self.inner.lock();
        Ok(inner
            .shards
            .iter()
            .map(|s| s.begin.clone())
            .filter(|b| *b >= range.begin && *b < range.end)
            .take(limit)
            .collect())
    }
}

struct MemTransaction {
    inner: Arc<Mutex<MemInner>>,
    budget: Option<usize>,
    hard_fault_after: Option<usize>,
    reads: usize,
}

#[async_trait]
impl Transaction for MemTransaction {
    fn disable_read_your_writes(&mut self) {}

    fn get_range(&mut self, range: KeyRange, opts: RangeOptions) -> KvStream<'_> {
        let mut out: Vec<Result<KeyValue, StoreError>> = Vec::new();
        {
            let inner = self.inner.lock();
            let iter = inner.data.range::<[u8], _>((
                Bound::Included(&range.begin[..]),
                Bound::Excluded(&range.end[..]),
            ));
            for (k, v) in iter.take(opts.limit) {
                if let Some(limit) = self.hard_fault_after {
                    if self.reads >= limit {
                        out.push(Err(StoreError::Unavailable(
                            "storage server lost".to_string(),
                        )));
                        break;
                    }
                }
                if let Some(budget) = self.budget {
                    if self.reads >= budget {
                        out.push(Err(StoreError::TxnTooOld));
                        break;
                    }
                }
                self.reads += 1;
                out.push(Ok(KeyValue {
                    key: Bytes::copy_from_slice(k),
                    value: Bytes::copy_from_slice(v),
                }));
            }
        }
        Box::pin(stream::iter(out))
    }

    async fn addresses_for_key(&mut self, key: &[u8]) -> Result<Vec<String>, StoreError> {
        if let Some(budget) = self.budget {
            if self.reads >= budget {
                return Err(StoreError::TxnTooOld);
            }
        }
        self.reads += 1;
        let inner = self.inner.lock();
        let shard = inner
            .shards
            .iter()
            .rev()
            .find(|s| &s.begin[..] <= key)
            .or_else(|| inner.shards.first());
        Ok(shard.map(|s| s.addresses.clone()).unwrap_or_default())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
