// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Coordinator-side session driver.
//!
//! One worker per planned host, all running concurrently: start a session,
//! stream the host's ranges, collect the manifest, optionally download the
//! finalized files back, end the session. A failing host never stops the
//! others; the run as a whole fails if any host failed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use derive_builder::Builder;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use kvlift_store::Database;

use crate::finder::Finder;
use crate::plan::{self, DialOpts, ExportGroup, ExportPlan};
use crate::proto::{ExportTarget, FileRequest, FinalizedFile, RangeRequest, SessionRef};

/// Coordinator configuration for one export run.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct ExporterOpts {
    pub target_url: String,
    #[builder(default = "4500")]
    pub grpc_port: u16,
    #[builder(default)]
    pub ca_file: Option<PathBuf>,
    #[builder(default)]
    pub tls_domain: Option<String>,
    #[builder(default)]
    pub dry_run: bool,
    #[builder(default = "4")]
    pub reader_threads: usize,
    /// Sampling percentage in `[0, 100]`.
    #[builder(default = "100")]
    pub read_percent: i32,
    #[builder(default)]
    pub compress: bool,
    #[builder(default = "String::from(\"archive\")")]
    pub export_format: String,
    /// When set and the target is file-backed, finalized files are pulled
    /// back here and removed from the agents.
    #[builder(default)]
    pub collect_dir: Option<PathBuf>,
    /// Where per-host summary files land; current directory when unset.
    #[builder(default)]
    pub summary_dir: Option<PathBuf>,
    /// Skip the per-range locality lookup and only report the keyspace
    /// tiling. Without replica hosts nothing can be placed, so no data
    /// moves.
    #[builder(default)]
    pub skip_host_resolution: bool,
}

pub struct Exporter {
    db: Arc<dyn Database>,
    opts: ExporterOpts,
}

impl Exporter {
    pub fn new(db: Arc<dyn Database>, opts: ExporterOpts) -> Self {
        Self { db, opts }
    }

    /// Discover, plan, and drive the whole export.
    pub async fn run(&self) -> anyhow::Result<()> {
        let finder = Finder::new(Arc::clone(&self.db));
        let pmap = finder
            .partition_map(self.opts.skip_host_resolution)
            .await
            .context("partition discovery failed")?;
        if pmap.is_empty() {
            info!("keyspace has no shards; nothing to export");
            return Ok(());
        }
        info!(
            ranges = pmap.ranges.len(),
            hosts = pmap.nodes.len(),
            "partition map ready"
        );

        if self.opts.skip_host_resolution {
            for location in &pmap.ranges {
                info!(range = %location.range, "discovered range");
            }
            info!(
                ranges = pmap.ranges.len(),
                "locality lookup skipped; discovery only, nothing exported"
            );
            return Ok(());
        }

        let dial = DialOpts {
            grpc_port: self.opts.grpc_port,
            ca_file: self.opts.ca_file.clone(),
            tls_domain: self.opts.tls_domain.clone(),
        };
        let plan = plan::assign_sources(&pmap, &dial).await?;
        self.schedule_fetch(plan).await
    }

    /// Drive every host in the plan concurrently and join them all.
    pub async fn schedule_fetch(&self, plan: ExportPlan) -> anyhow::Result<()> {
        let mut workers = JoinSet::new();
        for (host, group) in plan {
            let opts = self.opts.clone();
            workers.spawn(async move {
                let result = fetch_from_node(group, &opts).await;
                (host, result)
            });
        }

        let mut failed_hosts = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((host, Ok(()))) => info!(host = %host, "host export complete"),
                Ok((host, Err(e))) => {
                    error!(host = %host, error = ?e, "host export failed");
                    failed_hosts.push(host);
                }
                Err(join_err) => {
                    error!(error = %join_err, "host worker panicked");
                    failed_hosts.push("<unknown>".to_string());
                }
            }
        }

        if failed_hosts.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "export failed on {} host(s): {}",
                failed_hosts.len(),
                failed_hosts.join(", ")
            )
        }
    }
}

/// Run the full session protocol against one host.
pub async fn fetch_from_node(mut group: ExportGroup, opts: &ExporterOpts) -> anyhow::Result<()> {
    info!(host = %group.host, ranges = group.ranges.len(), "starting session");
    let resp = group
        .client
        .start_export_session(ExportTarget {
            target_url: opts.target_url.clone(),
            reader_threads: opts.reader_threads as i32,
            compress: opts.compress,
            read_percent: opts.read_percent,
            export_format: opts.export_format.clone(),
        })
        .await
        .context("unable to initiate session with peer")?
        .into_inner();
    let session_id = resp.session_id;

    if opts.dry_run {
        info!(host = %group.host, ranges = group.ranges.len(), "dry run: skipping range submission");
    } else {
        let (tx, rx) = mpsc::channel::<RangeRequest>(64);
        let feeder_ranges = group.ranges.clone();
        let feeder_session = session_id.clone();
        let feeder = tokio::spawn(async move {
            for range in feeder_ranges {
                let req = RangeRequest {
                    session_id: feeder_session.clone(),
                    begin: range.begin.to_vec(),
                    end: range.end.to_vec(),
                };
                if tx.send(req).await.is_err() {
                    break;
                }
            }
        });
        let summary = group
            .client
            .export(ReceiverStream::new(rx))
            .await
            .context("export stream failed")?
            .into_inner();
        let _ = feeder.await;
        info!(
            host = %group.host,
            ranges = summary.ranges_received,
            "export stream accepted"
        );
    }

    info!(host = %group.host, "closing session");
    let resp = group
        .client
        .stop_export_session(SessionRef {
            session_id: session_id.clone(),
        })
        .await
        .context("error from StopExportSession")?
        .into_inner();
    info!(host = %group.host, files = resp.finalized_files.len(), "export saved");
    save_archive_summary(
        &group.host,
        &resp.finalized_files,
        opts.summary_dir.as_deref(),
    )?;

    if let Some(collect_dir) = &opts.collect_dir {
        if is_local_target(&opts.target_url) {
            info!(host = %group.host, dest = %collect_dir.display(), "bringing files from node");
            collect_files(
                &mut group,
                &session_id,
                &opts.target_url,
                collect_dir,
                &resp.finalized_files,
            )
            .await?;
        } else {
            warn!(
                target_url = %opts.target_url,
                "collect requested but the target is not file-backed; leaving files in place"
            );
        }
    }

    group
        .client
        .end_export_session(SessionRef { session_id })
        .await
        .context("error from EndExportSession")?;
    Ok(())
}

/// Raw paths and `file://` urls are agent-local and can be streamed back.
fn is_local_target(target_url: &str) -> bool {
    !target_url.contains("://") || target_url.starts_with("file://")
}

async fn collect_files(
    group: &mut ExportGroup,
    session_id: &str,
    target_url: &str,
    collect_dir: &Path,
    files: &[FinalizedFile],
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(collect_dir).await?;
    for file in files {
        if file.shell_only {
            info!(file = %file.file_name, "skipping metadata-only segment (not downloadable)");
            continue;
        }
        info!(file = %file.file_name, "downloading");
        let started = Instant::now();
        let mut stream = group
            .client
            .get_exported_file(FileRequest {
                session_id: session_id.to_string(),
                target_url: target_url.to_string(),
                file_name: file.file_name.clone(),
            })
            .await
            .with_context(|| format!("GetExportedFile failed for {}", file.file_name))?
            .into_inner();

        let local_path = collect_dir.join(&file.file_name);
        let mut out = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&local_path)
            .await
            .with_context(|| format!("create of local file failed: {}", local_path.display()))?;

        let mut file_size: u64 = 0;
        let mut expected_block: i32 = 0;
        while let Some(block) = stream
            .message()
            .await
            .with_context(|| format!("recv on block of {} failed", file.file_name))?
        {
            expected_block += 1;
            if block.block_num != expected_block {
                anyhow::bail!(
                    "out-of-order block {} (expected {}) for {}",
                    block.block_num,
                    expected_block,
                    file.file_name
                );
            }
            file_size += block.block_data.len() as u64;
            out.write_all(&block.block_data).await?;
        }
        out.flush().await?;
        info!(
            file = %file.file_name,
            file_size,
            local_path = %local_path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "downloaded"
        );

        group
            .client
            .remove_exported_file(FileRequest {
                session_id: session_id.to_string(),
                target_url: target_url.to_string(),
                file_name: file.file_name.clone(),
            })
            .await
            .with_context(|| format!("delete of source file {} failed", file.file_name))?;
    }
    Ok(())
}

/// One line per finalized segment, tab-separated, `<host>.out`.
fn save_archive_summary(
    host: &str,
    files: &[FinalizedFile],
    dir: Option<&Path>,
) -> anyhow::Result<()> {
    use std::fmt::Write;

    let file_name = format!("{host}.out");
    let path = match dir {
        Some(dir) => dir.join(&file_name),
        None => PathBuf::from(&file_name),
    };
    let mut out = String::new();
    for f in files {
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}",
            f.file_name, f.key_range, f.content_size, f.row_count, f.checksum, f.shell_only
        );
    }
    std::fs::write(&path, out)
        .with_context(|| format!("unable to save results to {}", path.display()))?;
    Ok(())
}
