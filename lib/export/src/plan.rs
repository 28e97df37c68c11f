// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Placement planning: which host reads which ranges.
//!
//! Every shard is replicated to several hosts; always picking the first
//! replica would hot-spot one node per replica set. The planner bin-packs
//! greedily onto the least-loaded replica, which balances range counts
//! across hosts when shard sizes are roughly uniform.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tracing::{debug, info};

use kvlift_store::KeyRange;

use crate::finder::PartitionMap;
use crate::proto::export_service_client::ExportServiceClient;
use crate::MAX_MESSAGE_BYTES;

/// Ranges planned for extraction from one host, plus the channel to it.
pub struct ExportGroup {
    pub host: String,
    pub ranges: Vec<KeyRange>,
    pub client: ExportServiceClient<Channel>,
}

/// Placement decision for one run: host to its export group.
pub type ExportPlan = HashMap<String, ExportGroup>;

/// How to reach agent nodes.
#[derive(Debug, Clone, Default)]
pub struct DialOpts {
    pub grpc_port: u16,
    /// CA bundle for mutually authenticated TLS. Without it the channel is
    /// plaintext, which is only acceptable for development.
    pub ca_file: Option<PathBuf>,
    /// Server-name override when certificates are not issued per host.
    pub tls_domain: Option<String>,
}

/// Pure assignment step: least-loaded replica per range, first-seen
/// tie-break, in partition-map order. Returns `(host, ranges)` groups in
/// first-assignment order.
pub fn plan_assignments(pmap: &PartitionMap) -> anyhow::Result<Vec<(String, Vec<KeyRange>)>> {
    let mut busy: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<KeyRange>> = HashMap::new();

    for location in &pmap.ranges {
        let mut chosen: Option<&str> = None;
        let mut load = usize::MAX;
        for host in &location.hosts {
            let current = busy.get(host.as_str()).copied().unwrap_or(0);
            if current < load {
                chosen = Some(host);
                load = current;
            }
        }
        let Some(host) = chosen else {
            anyhow::bail!(
                "range {} has no replica hosts; was locality resolution skipped?",
                location.range
            );
        };
        debug!(range = %location.range, host, load, "range assignment");

        let host = host.to_string();
        *busy.entry(host.clone()).or_insert(0) += 1;
        if !groups.contains_key(&host) {
            order.push(host.clone());
        }
        groups.entry(host).or_default().push(location.range.clone());
    }

    Ok(order
        .into_iter()
        .map(|host| {
            let ranges = groups.remove(&host).unwrap_or_default();
            (host, ranges)
        })
        .collect())
}

/// Assign ranges and dial one channel per chosen host. A host that cannot
/// be dialed aborts the whole plan.
pub async fn assign_sources(pmap: &PartitionMap, opts: &DialOpts) -> anyhow::Result<ExportPlan> {
    let mut plan = ExportPlan::new();
    for (host, ranges) in plan_assignments(pmap)? {
        let client = dial(&host, opts)
            .await
            .with_context(|| format!("failed to dial {host}"))?;
        info!(host = %host, ranges = ranges.len(), "export plan entry");
        plan.insert(host.clone(), ExportGroup {
            host,
            ranges,
            client,
        });
    }
    Ok(plan)
}

/// Open a channel to one agent.
pub async fn dial(
    host: &str,
    opts: &DialOpts,
) -> anyhow::Result<ExportServiceClient<Channel>> {
    let scheme = if opts.ca_file.is_some() { "https" } else { "http" };
    let mut endpoint = Channel::from_shared(format!("{scheme}://{host}:{}", opts.grpc_port))?
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5));

    if let Some(ca_file) = &opts.ca_file {
        let pem = std::fs::read(ca_file)
            .with_context(|| format!("unable to read CA file {}", ca_file.display()))?;
        let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
        if let Some(domain) = &opts.tls_domain {
            tls = tls.domain_name(domain.clone());
        }
        endpoint = endpoint.tls_config(tls)?;
    }

    let channel = endpoint.connect().await?;
    Ok(ExportServiceClient::new(channel)
        .max_decoding_message_size(MAX_MESSAGE_BYTES)
        .max_encoding_message_size(MAX_MESSAGE_BYTES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::RangeLocation;
    use bytes::Bytes;
    use kvlift_store::keyspace_end;

    fn location(begin: &[u8], end: &[u8], hosts: &[&str]) -> RangeLocation {
        RangeLocation {
            range: KeyRange::new(
                Bytes::copy_from_slice(begin),
                Bytes::copy_from_slice(end),
            ),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
        }
    }

    fn pmap(ranges: Vec<RangeLocation>) -> PartitionMap {
        PartitionMap {
            ranges,
            nodes: HashMap::new(),
        }
    }

    #[test]
    fn least_loaded_with_first_seen_tie_break() {
        // Two shards: {h1, h2} and {h2, h3}. Both picks land on the
        // first-seen zero-load replica.
        let map = pmap(vec![
            location(b"", b"k500", &["h1", "h2"]),
            location(b"k500", b"\xff", &["h2", "h3"]),
        ]);
        let assignments = plan_assignments(&map).unwrap();
        let by_host: HashMap<_, _> = assignments
            .iter()
            .map(|(h, r)| (h.as_str(), r.len()))
            .collect();
        assert_eq!(by_host.get("h1"), Some(&1));
        assert_eq!(by_host.get("h2"), Some(&1));
        assert_eq!(by_host.get("h3"), None);
    }

    #[test]
    fn every_range_is_assigned_exactly_once() {
        let hosts_cycle = [
            &["h1", "h2"][..],
            &["h2", "h3"][..],
            &["h3", "h1"][..],
        ];
        let mut ranges = Vec::new();
        let mut begin = Vec::new();
        for i in 0..30usize {
            let end = format!("k{i:03}").into_bytes();
            ranges.push(location(&begin, &end, hosts_cycle[i % 3]));
            begin = end;
        }
        ranges.push(location(&begin, &keyspace_end(), &["h1"]));
        let total = ranges.len();

        let map = pmap(ranges);
        let assignments = plan_assignments(&map).unwrap();
        let assigned: usize = assignments.iter().map(|(_, r)| r.len()).sum();
        assert_eq!(assigned, total);

        // No range appears under two hosts.
        let mut seen = std::collections::HashSet::new();
        for (_, ranges) in &assignments {
            for r in ranges {
                assert!(seen.insert(r.clone()), "range {r} assigned twice");
            }
        }
    }

    #[test]
    fn identical_replica_sets_balance_within_one() {
        let replicas = &["h1", "h2", "h3"][..];
        let mut ranges = Vec::new();
        let mut begin = Vec::new();
        for i in 0..20usize {
            let end = format!("k{i:03}").into_bytes();
            ranges.push(location(&begin, &end, replicas));
            begin = end;
        }
        ranges.push(location(&begin, &keyspace_end(), replicas));

        let map = pmap(ranges);
        let total = map.ranges.len();
        let assignments = plan_assignments(&map).unwrap();
        let sizes: Vec<usize> = assignments.iter().map(|(_, r)| r.len()).collect();
        assert_eq!(sizes.len(), 3);
        let max = sizes.iter().max().unwrap();
        let min = sizes.iter().min().unwrap();
        let bound = total.div_ceil(3) - total / 3;
        assert!(max - min <= bound, "unbalanced plan: {sizes:?}");
    }

    #[test]
    fn empty_replica_set_aborts_the_plan() {
        let map = pmap(vec![location(b"", b"\xff", &[])]);
        assert!(plan_assignments(&map).is_err());
    }
}
