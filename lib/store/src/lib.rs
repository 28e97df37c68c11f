// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Storage-cluster interface for the kvlift export pipeline.
//!
//! The export engine never talks to a concrete key-value store directly; it
//! goes through the [`Database`] / [`Transaction`] traits defined here. The
//! production cluster bindings live behind this seam, and the in-memory
//! [`mem::MemStore`] implements the same contract for development and tests,
//! including injection of the store's per-transaction wall-clock error.

mod key;
pub mod mem;
mod traits;

use std::sync::Arc;

pub use key::{keyspace_end, printable, KeyRange};
pub use traits::{Database, KeyValue, KvStream, RangeOptions, StreamingMode, Transaction};

/// Error code the cluster reports when a transaction outlives its read window.
pub const TXN_TOO_OLD: i32 = 1007;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The transaction exceeded the store's wall-clock read window and must
    /// be restarted from the last observed key.
    #[error("transaction too old (code {TXN_TOO_OLD})")]
    TxnTooOld,

    #[error("invalid key range: {0}")]
    InvalidRange(String),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported cluster url: {0}")]
    UnsupportedCluster(String),
}

impl StoreError {
    /// Numeric error code as reported by the cluster, for log parity with
    /// the store's own tooling.
    pub fn code(&self) -> i32 {
        match self {
            StoreError::TxnTooOld => TXN_TOO_OLD,
            _ => -1,
        }
    }

    /// True for errors that are recovered inside the reader state machine.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::TxnTooOld)
    }
}

/// Open a database handle for a cluster url.
///
/// `mem:` gives a fresh in-memory store. Real cluster schemes are provided
/// by external bindings implementing [`Database`].
pub fn connect(url: &str) -> Result<Arc<dyn Database>, StoreError> {
    match url.split(':').next() {
        Some("mem") => Ok(Arc::new(mem::MemStore::new())),
        _ => Err(StoreError::UnsupportedCluster(url.to_string())),
    }
}
