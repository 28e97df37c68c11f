// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Keyspace partition discovery.
//!
//! The finder enumerates the cluster's shard boundary keys and, for each
//! resulting range, the storage hosts holding it. The output
//! [`PartitionMap`] tiles the whole user keyspace `["", \xff)` with
//! contiguous, non-overlapping, end-exclusive ranges.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use kvlift_store::{keyspace_end, Database, KeyRange, StoreError};

/// Maximum boundary keys requested per discovery call.
pub const BOUNDARY_KEY_BATCH: usize = 1000;

/// A key range and the hosts holding a replica of it.
#[derive(Debug, Clone)]
pub struct RangeLocation {
    pub range: KeyRange,
    pub hosts: Vec<String>,
}

/// Discovered layout of the keyspace for one export run.
#[derive(Debug, Default)]
pub struct PartitionMap {
    /// Ranges in key order, tiling the keyspace.
    pub ranges: Vec<RangeLocation>,
    /// Inverted index: host to the ranges it holds.
    pub nodes: HashMap<String, Vec<KeyRange>>,
}

impl PartitionMap {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

pub struct Finder {
    db: Arc<dyn Database>,
}

impl Finder {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Enumerate all shard boundary keys.
    ///
    /// Iterative: each call returns a batch starting at the cursor. On
    /// continuation calls the store re-echoes the cursor at position 0, so
    /// only later positions are new. A call returning at most one key
    /// terminates discovery; the rare store whose very first call returns a
    /// single key still contributes that key.
    pub async fn boundary_keys(&self) -> Result<Vec<Bytes>, StoreError> {
        let mut boundaries: Vec<Bytes> = Vec::new();
        let mut cursor = Bytes::new();

        loop {
            let keys = self
                .db
                .boundary_keys(
                    KeyRange::new(cursor.clone(), keyspace_end()),
                    BOUNDARY_KEY_BATCH,
                )
                .await?;
            if keys.len() > 1 {
                let new_from = if boundaries.is_empty() { 0 } else { 1 };
                cursor = keys[keys.len() - 1].clone();
                debug!(
                    batch = keys.len(),
                    cursor = %kvlift_store::printable(&cursor),
                    "boundary key batch"
                );
                boundaries.extend(keys.into_iter().skip(new_from));
            } else {
                if boundaries.is_empty() && keys.len() == 1 {
                    boundaries.extend(keys);
                }
                break;
            }
        }
        debug!(count = boundaries.len(), "boundary discovery complete");
        Ok(boundaries)
    }

    /// Build the partition map: consecutive boundary-key pairs become
    /// ranges (the last range ends at `\xff`), each annotated with its
    /// replica hosts.
    ///
    /// Locality lookups are batched inside one read transaction; when the
    /// transaction window closes the transaction is restarted and the
    /// lookup re-issued. `skip_host_resolution` leaves every host set empty
    /// for callers that only need the tiling.
    pub async fn partition_map(
        &self,
        skip_host_resolution: bool,
    ) -> Result<PartitionMap, StoreError> {
        let keys = self.boundary_keys().await?;
        let mut ranges = Vec::with_capacity(keys.len());
        let mut nodes: HashMap<String, Vec<KeyRange>> = HashMap::new();
        let mut txn = self.db.create_transaction().await?;

        for (i, begin) in keys.iter().enumerate() {
            let end = keys.get(i + 1).cloned().unwrap_or_else(keyspace_end);
            let range = KeyRange::new(begin.clone(), end);

            let hosts: Vec<String> = if skip_host_resolution {
                Vec::new()
            } else {
                let addresses = match txn.addresses_for_key(begin).await {
                    Ok(addresses) => addresses,
                    Err(StoreError::TxnTooOld) => {
                        debug!("locality transaction window closed, restarting");
                        let fresh = self.db.create_transaction().await?;
                        let stale = std::mem::replace(&mut txn, fresh);
                        let _ = stale.commit().await;
                        txn.addresses_for_key(begin).await?
                    }
                    Err(e) => return Err(e),
                };
                addresses
                    .iter()
                    .map(|a| a.split(':').next().unwrap_or(a).to_string())
                    .collect()
            };

            for host in &hosts {
                nodes.entry(host.clone()).or_default().push(range.clone());
            }
            ranges.push(RangeLocation { range, hosts });
        }
        let _ = txn.commit().await;

        Ok(PartitionMap { ranges, nodes })
    }
}
