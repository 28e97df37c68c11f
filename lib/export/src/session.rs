// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Agent-side export session.
//!
//! A session is a long-lived pipeline: the Export stream handler feeds key
//! ranges into a rendezvous inbox, a fixed pool of reader workers consumes
//! them, and a single aggregator task folds their stats. The results
//! registry collects finalized archive segments until the session ends.
//!
//! Nothing here locks around the workers: finalization closes the inbox and
//! joins the tasks. The shutdown order is load-bearing: the range inbox
//! must drain before the stats inbox closes, or worker stats are lost.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use kvlift_archive::SegmentInfo;
use kvlift_store::{Database, KeyRange};

use crate::reader::{self, ReaderCtx};
use crate::SessionError;

/// Stats emitted by a reader after finishing one range.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderStat {
    pub keys_read: i64,
    /// Bytes observed, sampled-out records included.
    pub bytes_seen: i64,
    /// Bytes actually written to the archive.
    pub bytes_saved: i64,
}

/// Output format for exported records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Length-prefixed binary records.
    Archive,
    /// Keys only, newline-terminated.
    Text,
}

impl ExportFormat {
    /// An empty or `archive` tag selects the binary format; any other tag
    /// falls back to the keys-only text format.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "" | "archive" => ExportFormat::Archive,
            _ => ExportFormat::Text,
        }
    }
}

/// Parameters a coordinator supplies at session start.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub target_url: String,
    pub reader_threads: usize,
    pub compress: bool,
    /// Sampling percentage in `[0, 100]`.
    pub read_percent: u32,
    pub export_format: ExportFormat,
}

/// Finalized segments produced by a session so far.
#[derive(Default)]
pub struct ResultsRegistry {
    segments: Vec<SegmentInfo>,
    files: HashSet<String>,
}

impl ResultsRegistry {
    pub fn add(&mut self, segment: SegmentInfo) {
        self.files.insert(segment.file_name.clone());
        self.segments.push(segment);
    }

    pub fn contains_file(&self, file_name: &str) -> bool {
        self.files.contains(file_name)
    }

    pub fn snapshot(&self) -> Vec<SegmentInfo> {
        self.segments.clone()
    }
}

pub struct ExportSession {
    session_id: String,
    target_url: String,
    range_tx: Option<flume::Sender<KeyRange>>,
    stats_tx: Option<flume::Sender<ReaderStat>>,
    workers: Vec<JoinHandle<Result<(), SessionError>>>,
    stats_task: Option<JoinHandle<()>>,
    results: Arc<Mutex<ResultsRegistry>>,
    outcome: Option<Result<Vec<SegmentInfo>, String>>,
}

impl ExportSession {
    /// Build the session and start its worker pool immediately.
    pub fn new(db: Arc<dyn Database>, spec: SessionSpec) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let threads = spec.reader_threads.max(1);

        // Rendezvous channels: the stream handler blocks on a busy pool
        // (backpressure) and workers block on an idle stream.
        let (range_tx, range_rx) = flume::bounded::<KeyRange>(0);
        let (stats_tx, stats_rx) = flume::bounded::<ReaderStat>(0);
        let results = Arc::new(Mutex::new(ResultsRegistry::default()));

        info!(
            session_id = %session_id,
            threads,
            target_url = %spec.target_url,
            read_percent = spec.read_percent,
            "starting export session"
        );

        let mut workers = Vec::with_capacity(threads);
        for worker in 0..threads {
            let ctx = ReaderCtx {
                db: Arc::clone(&db),
                target_url: spec.target_url.clone(),
                compress: spec.compress,
                read_percent: spec.read_percent.min(100),
                format: spec.export_format,
                stats_tx: stats_tx.clone(),
                results: Arc::clone(&results),
            };
            workers.push(tokio::spawn(reader::run_worker(
                worker,
                ctx,
                range_rx.clone(),
            )));
        }
        let stats_task = tokio::spawn(run_stats(stats_rx, Arc::clone(&results)));

        Self {
            session_id,
            target_url: spec.target_url,
            range_tx: Some(range_tx),
            stats_tx: Some(stats_tx),
            workers,
            stats_task: Some(stats_task),
            results,
            outcome: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// Hand one range to the reader pool, waiting until a worker takes it.
    pub async fn send(&self, range: KeyRange) -> Result<(), SessionError> {
        match &self.range_tx {
            Some(tx) => tx
                .send_async(range)
                .await
                .map_err(|_| SessionError::InboxClosed),
            None => Err(SessionError::InboxClosed),
        }
    }

    /// True when `(target_url, file_name)` names a finalized segment of
    /// this session.
    pub fn is_result_file(&self, target_url: &str, file_name: &str) -> bool {
        target_url == self.target_url && self.results.lock().contains_file(file_name)
    }

    /// Drain and shut down the pipeline, returning the finalized segments.
    ///
    /// Idempotent: repeated calls return the first outcome. A failed reader
    /// worker turns the whole session outcome into an error; segments
    /// already at the sink stay there for the consumer to garbage-collect.
    pub async fn finalize(&mut self) -> Result<Vec<SegmentInfo>, SessionError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone().map_err(SessionError::Worker);
        }

        // 1. Close the range inbox and join every worker.
        self.range_tx.take();
        let mut first_error: Option<String> = None;
        for worker in self.workers.drain(..) {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(session_id = %self.session_id, error = %e, "reader worker failed");
                    first_error.get_or_insert_with(|| e.to_string());
                }
                Err(join_err) => {
                    error!(session_id = %self.session_id, error = %join_err, "reader worker panicked");
                    first_error.get_or_insert_with(|| join_err.to_string());
                }
            }
        }

        // 2. Only now close the stats inbox and join the aggregator.
        self.stats_tx.take();
        if let Some(stats) = self.stats_task.take() {
            let _ = stats.await;
        }

        let outcome = match first_error {
            None => Ok(self.results.lock().snapshot()),
            Some(message) => Err(message),
        };
        self.outcome = Some(outcome.clone());
        outcome.map_err(SessionError::Worker)
    }
}

/// Single consumer of worker stats: progress lines while running, totals
/// and a per-segment summary at shutdown.
async fn run_stats(stats_rx: flume::Receiver<ReaderStat>, results: Arc<Mutex<ResultsRegistry>>) {
    let mut total_keys: i64 = 0;
    let mut total_bytes: i64 = 0;
    let mut last_printed: i64 = 0;
    let started = Instant::now();

    while let Ok(stat) = stats_rx.recv_async().await {
        total_keys += stat.keys_read;
        total_bytes += stat.bytes_saved;
        if total_keys - last_printed > 1_000_000 {
            let seconds = started.elapsed().as_secs_f64().max(f64::EPSILON);
            info!(
                keys = total_keys,
                bytes = total_bytes,
                keys_per_sec = (total_keys as f64 / seconds) as i64,
                bytes_per_sec = (total_bytes as f64 / seconds) as i64,
                "export progress"
            );
            last_printed = total_keys;
        }
    }

    info!(keys = total_keys, bytes = total_bytes, "session totals");
    for segment in results.lock().snapshot() {
        info!(
            file = %segment.file_name,
            range = %segment.key_range,
            rows = segment.row_count,
            bytes = segment.content_size,
            "finalized segment"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlift_store::mem::MemStore;
    use tempfile::TempDir;

    fn spec(target: &str) -> SessionSpec {
        SessionSpec {
            target_url: target.to_string(),
            reader_threads: 2,
            compress: false,
            read_percent: 100,
            export_format: ExportFormat::Archive,
        }
    }

    #[test]
    fn format_tag_parsing() {
        assert_eq!(ExportFormat::from_tag("archive"), ExportFormat::Archive);
        assert_eq!(ExportFormat::from_tag(""), ExportFormat::Archive);
        assert_eq!(ExportFormat::from_tag("text"), ExportFormat::Text);
        assert_eq!(ExportFormat::from_tag("keys"), ExportFormat::Text);
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = MemStore::new();
        store.insert("a", "1");
        let mut session = ExportSession::new(
            Arc::new(store),
            spec(dir.path().to_str().unwrap()),
        );
        session.send(KeyRange::all()).await.unwrap();

        let first = session.finalize().await.unwrap();
        assert_eq!(first.len(), 1);
        let second = session.finalize().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn send_after_finalize_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = MemStore::new();
        let mut session = ExportSession::new(
            Arc::new(store),
            spec(dir.path().to_str().unwrap()),
        );
        session.finalize().await.unwrap();
        assert!(matches!(
            session.send(KeyRange::all()).await,
            Err(SessionError::InboxClosed)
        ));
    }

    #[tokio::test]
    async fn worker_failure_surfaces_in_finalize_and_is_sticky() {
        // Target directory is a plain file: archive creation fails and the
        // worker that picks up the range dies.
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("occupied");
        std::fs::write(&bogus, b"not a directory").unwrap();

        let store = MemStore::new();
        store.insert("a", "1");
        let mut session = ExportSession::new(
            Arc::new(store),
            spec(bogus.to_str().unwrap()),
        );
        // The send may or may not be accepted depending on how fast the
        // worker dies; either way finalize must report the failure.
        let _ = session.send(KeyRange::all()).await;

        assert!(session.finalize().await.is_err());
        assert!(session.finalize().await.is_err());
    }
}
