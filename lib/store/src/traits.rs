// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cluster access traits.
//!
//! These mirror the subset of a partitioned transactional KV store the
//! export engine needs: boundary-key discovery, per-key replica locality,
//! and bounded range reads inside short-lived read transactions.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::{KeyRange, StoreError};

/// One key-value pair observed by a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
}

/// How the store paces a range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingMode {
    /// Fetch rows one batch at a time with no speculative prefetch. The
    /// export readers use this: the downstream archive write is the
    /// bottleneck, and prefetched rows are wasted work when the transaction
    /// window closes mid-range.
    Serial,
    /// Let the store stream as fast as it can.
    #[default]
    WantAll,
}

#[derive(Debug, Clone, Copy)]
pub struct RangeOptions {
    /// Maximum number of rows the call may return.
    pub limit: usize,
    pub mode: StreamingMode,
}

/// Stream of range-read results. Items may fail mid-stream; in particular a
/// [`StoreError::TxnTooOld`] item means the transaction window closed and
/// rows already yielded remain valid.
pub type KvStream<'a> = BoxStream<'a, Result<KeyValue, StoreError>>;

#[async_trait]
pub trait Database: Send + Sync {
    async fn create_transaction(&self) -> Result<Box<dyn Transaction>, StoreError>;

    /// Shard boundary keys within `range`, at most `limit` of them.
    ///
    /// The first element of a continuation call (one whose `range.begin` was
    /// itself returned by a previous call) re-echoes that cursor key.
    async fn boundary_keys(&self, range: KeyRange, limit: usize)
        -> Result<Vec<Bytes>, StoreError>;
}

#[async_trait]
pub trait Transaction: Send {
    /// Disable the read-your-writes cache. Pure reader transactions set this
    /// to avoid buffering every observed row client-side.
    fn disable_read_your_writes(&mut self);

    /// Read `[range.begin, range.end)` in key order, up to `opts.limit` rows.
    fn get_range(&mut self, range: KeyRange, opts: RangeOptions) -> KvStream<'_>;

    /// Addresses (`host:port`) of the storage servers holding `key`.
    async fn addresses_for_key(&mut self, key: &[u8]) -> Result<Vec<String>, StoreError>;

    /// Commit the transaction. Advisory for read-only transactions; callers
    /// on the reader path treat failures as best-effort.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
