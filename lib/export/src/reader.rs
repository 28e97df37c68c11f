// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Range reader state machine.
//!
//! A worker pulls key ranges off the session inbox and walks each one with
//! bounded read transactions. The store caps a transaction's wall-clock
//! window (~5s), so transactions are rotated long before a large range is
//! exhausted:
//!
//! - On a clean batch end the transaction is replaced once the batch limit
//!   is reached and the walk resumes from the last observed key.
//! - On `TxnTooOld` the batch limit adapts down to roughly what the window
//!   actually allowed (multiple of 100, floor 100) and the walk resumes.
//! - Resuming re-reads the cursor key (begin is inclusive); exactly one
//!   byte-equal occurrence is skipped. The empty key gets no special case.
//!
//! Retries on `TxnTooOld` are unbounded; every retry makes progress because
//! rows observed before the window closed were already archived.

use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, info, warn};

use kvlift_archive::record::{self, SUSPICIOUS_KEY_LEN};
use kvlift_archive::{ArchiveOpts, ArchiveSink};
use kvlift_store::{
    printable, Database, KeyRange, RangeOptions, StoreError, StreamingMode, Transaction,
};

use crate::session::{ExportFormat, ReaderStat, ResultsRegistry};
use crate::SessionError;

pub(crate) const INITIAL_BATCH_LIMIT: usize = 100_000;
const MIN_BATCH_LIMIT: usize = 100;

pub(crate) struct ReaderCtx {
    pub db: Arc<dyn Database>,
    pub target_url: String,
    pub compress: bool,
    pub read_percent: u32,
    pub format: ExportFormat,
    pub stats_tx: flume::Sender<ReaderStat>,
    pub results: Arc<Mutex<ResultsRegistry>>,
}

/// Worker loop: one range at a time until the inbox closes.
pub(crate) async fn run_worker(
    worker: usize,
    ctx: ReaderCtx,
    ranges: flume::Receiver<KeyRange>,
) -> Result<(), SessionError> {
    while let Ok(range) = ranges.recv_async().await {
        read_range(worker, &ctx, range).await?;
    }
    Ok(())
}

enum BatchEnd {
    /// The stream ran out of rows before the limit: the range is done
    /// unless the limit itself cut the batch short.
    Drained,
    /// The transaction window closed mid-batch.
    TooOld,
}

/// Export one range into its own archive writer.
pub(crate) async fn read_range(
    worker: usize,
    ctx: &ReaderCtx,
    range: KeyRange,
) -> Result<(), SessionError> {
    let range_id = range.to_string();
    let mut sink = kvlift_archive::create(
        &ctx.target_url,
        ArchiveOpts {
            compress: ctx.compress,
            ..ArchiveOpts::default()
        },
    )?;

    let outcome = drive_range(worker, ctx, range, sink.as_mut()).await;
    let stats = match &outcome {
        Ok(stats) => *stats,
        Err(_) => {
            // Drop the writer without registering anything; partial files
            // are the consumer's to garbage-collect.
            drop(sink);
            return outcome.map(|_| ());
        }
    };

    let _ = ctx.stats_tx.send_async(stats.stat).await;

    let segments = sink.close()?;
    let mut results = ctx.results.lock();
    for mut segment in segments {
        segment.key_range = range_id.clone();
        segment.row_count = stats.rows_written;
        results.add(segment);
    }
    Ok(())
}

#[derive(Clone, Copy)]
struct RangeStats {
    stat: ReaderStat,
    rows_written: i64,
}

async fn drive_range(
    worker: usize,
    ctx: &ReaderCtx,
    range: KeyRange,
    sink: &mut dyn ArchiveSink,
) -> Result<RangeStats, SessionError> {
    let end = range.end.clone();
    let mut cursor = range.begin.clone();
    let mut txn = new_reader_txn(ctx.db.as_ref()).await?;
    let mut batch_limit = INITIAL_BATCH_LIMIT;
    let mut keys_read: i64 = 0;
    let mut rows_written: i64 = 0;
    let mut bytes_seen: i64 = 0;
    let mut bytes_saved: i64 = 0;
    let mut read_in_txn: usize = 0;
    // Per-worker PRNG; must stay `Send` across the read loop's awaits.
    let mut rng = StdRng::from_os_rng();
    let mut buf = BytesMut::new();

    loop {
        debug!(
            worker,
            after = read_in_txn,
            begin = %printable(&cursor),
            end = %printable(&end),
            "querying range"
        );

        let batch_end = {
            let mut rows = txn.get_range(
                KeyRange::new(cursor.clone(), end.clone()),
                RangeOptions {
                    limit: batch_limit,
                    mode: StreamingMode::Serial,
                },
            );
            let mut batch_end = BatchEnd::Drained;
            loop {
                let Some(item) = rows.next().await else {
                    break;
                };
                match item {
                    Ok(kv) => {
                        if read_in_txn == 0 && keys_read != 0 && kv.key == cursor {
                            // A resumed walk re-reads its inclusive begin
                            // key; skip the one byte-equal repeat.
                            debug!(worker, key = %printable(&kv.key), "skipping repeat read");
                            continue;
                        }
                        keys_read += 1;
                        read_in_txn += 1;
                        bytes_seen += (kv.key.len() + kv.value.len()) as i64;
                        if kv.key.len() > SUSPICIOUS_KEY_LEN {
                            warn!(worker, key_len = kv.key.len(), "suspicious key length");
                        }
                        if ctx.read_percent >= 100
                            || rng.random_range(0..100) < ctx.read_percent
                        {
                            let n = match ctx.format {
                                ExportFormat::Archive => {
                                    buf.clear();
                                    record::encode_record(&mut buf, &kv.key, &kv.value)?;
                                    sink.write(&buf)?
                                }
                                ExportFormat::Text => {
                                    sink.write(&kv.key)? + sink.write(b"\n")?
                                }
                            };
                            rows_written += 1;
                            bytes_saved += n as i64;
                        }
                        cursor = kv.key;
                    }
                    Err(StoreError::TxnTooOld) => {
                        batch_end = BatchEnd::TooOld;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            batch_end
        };

        match batch_end {
            BatchEnd::TooOld => {
                // Tune the next batch towards what the window actually
                // allowed, rounded down to a multiple of 100, floor 100.
                batch_limit = (read_in_txn / 100 * 100).max(MIN_BATCH_LIMIT);
                info!(
                    worker,
                    after = read_in_txn,
                    key = %printable(&cursor),
                    new_batch_limit = batch_limit,
                    "transaction window hit, restarting"
                );
                txn = replace_txn(ctx.db.as_ref(), txn).await?;
                read_in_txn = 0;
            }
            BatchEnd::Drained => {
                // One short of the limit: asking for n rows while skipping
                // the repeated begin key yields n-1 useful ones.
                if read_in_txn >= batch_limit.saturating_sub(1) {
                    debug!(
                        worker,
                        after = read_in_txn,
                        total = keys_read,
                        "batch limit hit, starting another batch"
                    );
                    txn = replace_txn(ctx.db.as_ref(), txn).await?;
                    read_in_txn = 0;
                } else {
                    break;
                }
            }
        }
    }

    debug!(
        worker,
        range = %range,
        keys = keys_read,
        "done with key range"
    );
    let _ = txn.commit().await;

    Ok(RangeStats {
        stat: ReaderStat {
            keys_read,
            bytes_seen,
            bytes_saved,
        },
        rows_written,
    })
}

async fn new_reader_txn(db: &dyn Database) -> Result<Box<dyn Transaction>, SessionError> {
    let mut txn = db.create_transaction().await?;
    // Pure reader path: the read-your-writes cache would only hold memory.
    txn.disable_read_your_writes();
    Ok(txn)
}

/// Start a fresh reader transaction and commit the old one best-effort.
async fn replace_txn(
    db: &dyn Database,
    old: Box<dyn Transaction>,
) -> Result<Box<dyn Transaction>, SessionError> {
    let _ = old.commit().await;
    new_reader_txn(db).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use kvlift_store::mem::MemStore;
    use kvlift_store::keyspace_end;
    use tempfile::TempDir;
    use tokio_util::codec::Decoder;

    fn seeded(n: usize) -> MemStore {
        let store = MemStore::new();
        for i in 0..n {
            store.insert(format!("k{i:06}"), format!("v{i:06}"));
        }
        store
    }

    struct Harness {
        dir: TempDir,
        results: Arc<Mutex<ResultsRegistry>>,
        stats_rx: flume::Receiver<ReaderStat>,
        ctx: ReaderCtx,
    }

    fn harness(store: MemStore, read_percent: u32) -> Harness {
        let dir = TempDir::new().unwrap();
        let results = Arc::new(Mutex::new(ResultsRegistry::default()));
        let (stats_tx, stats_rx) = flume::bounded(16);
        let ctx = ReaderCtx {
            db: Arc::new(store),
            target_url: dir.path().to_str().unwrap().to_string(),
            compress: false,
            read_percent,
            format: ExportFormat::Archive,
            stats_tx,
            results: Arc::clone(&results),
        };
        Harness {
            dir,
            results,
            stats_rx,
            ctx,
        }
    }

    fn decode_segment(dir: &TempDir, file_name: &str) -> Vec<(Bytes, Bytes)> {
        let raw = std::fs::read(dir.path().join(file_name)).unwrap();
        let mut buf = BytesMut::from(&raw[..]);
        let mut codec = record::RecordCodec::new();
        let mut out = Vec::new();
        while let Some(rec) = codec.decode(&mut buf).unwrap() {
            out.push(rec);
        }
        assert!(buf.is_empty(), "trailing bytes after last record");
        out
    }

    #[tokio::test]
    async fn exports_a_small_range_in_key_order() {
        let h = harness(seeded(100), 100);
        read_range(0, &h.ctx, KeyRange::all()).await.unwrap();

        let segments = h.results.lock().snapshot();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].row_count, 100);
        assert_eq!(segments[0].key_range, KeyRange::all().to_string());

        let records = decode_segment(&h.dir, &segments[0].file_name);
        assert_eq!(records.len(), 100);
        assert!(records.windows(2).all(|w| w[0].0 < w[1].0));

        let stat = h.stats_rx.recv().unwrap();
        assert_eq!(stat.keys_read, 100);
        // Saved bytes carry the 4-byte length word per record on top of
        // the raw key/value bytes seen.
        assert_eq!(stat.bytes_saved, stat.bytes_seen + 100 * 4);
        assert_eq!(stat.bytes_saved, segments[0].content_size as i64);
    }

    #[tokio::test]
    async fn window_restart_tunes_batch_limit_and_loses_nothing() {
        // 10,000 keys; the first transaction dies after exactly 2,345
        // reads. The walk must resume, emit every key exactly once, and
        // adopt 2,300 as the next batch limit.
        let store = seeded(10_000);
        store.push_fault(2_345);
        let h = harness(store, 100);
        read_range(0, &h.ctx, KeyRange::all()).await.unwrap();

        let segments = h.results.lock().snapshot();
        assert_eq!(segments.len(), 1, "one archive per range");
        assert_eq!(segments[0].row_count, 10_000);

        let records = decode_segment(&h.dir, &segments[0].file_name);
        assert_eq!(records.len(), 10_000);
        assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
        // After the 2,345-read window the limit becomes floor/100*100.
        // Subsequent batches then run at 2,300: ceil remaining work fits.
        // The count above is the real assertion; the limit is visible via
        // the number of unique keys still being exact after many restarts.
    }

    #[tokio::test]
    async fn repeated_windows_never_drop_or_duplicate_keys() {
        // Every transaction dies after 137 reads, at arbitrary positions
        // relative to batch boundaries. Dedup keeps the output exact.
        let store = seeded(2_000);
        store.fail_after_reads(137);
        let h = harness(store, 100);
        read_range(3, &h.ctx, KeyRange::all()).await.unwrap();

        let segments = h.results.lock().snapshot();
        let records = decode_segment(&h.dir, &segments[0].file_name);
        assert_eq!(records.len(), 2_000);
        assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test]
    async fn tiny_windows_floor_at_minimum_batch() {
        // A window of 3 reads tunes the limit to the floor of 100 and the
        // export still terminates with every key present.
        let store = seeded(500);
        store.fail_after_reads(3);
        let h = harness(store, 100);
        read_range(0, &h.ctx, KeyRange::all()).await.unwrap();

        let records = {
            let segments = h.results.lock().snapshot();
            decode_segment(&h.dir, &segments[0].file_name)
        };
        assert_eq!(records.len(), 500);
    }

    #[tokio::test]
    async fn subrange_respects_bounds() {
        let h = harness(seeded(100), 100);
        let range = KeyRange::new(&b"k000010"[..], &b"k000020"[..]);
        read_range(0, &h.ctx, range).await.unwrap();

        let segments = h.results.lock().snapshot();
        let records = decode_segment(&h.dir, &segments[0].file_name);
        assert_eq!(records.len(), 10);
        assert_eq!(&records[0].0[..], b"k000010");
        assert_eq!(&records[9].0[..], b"k000019");
    }

    #[tokio::test]
    async fn empty_range_produces_empty_segment() {
        let h = harness(seeded(10), 100);
        let range = KeyRange::new(&b"z"[..], keyspace_end());
        read_range(0, &h.ctx, range).await.unwrap();

        let segments = h.results.lock().snapshot();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].row_count, 0);
        assert_eq!(segments[0].content_size, 0);
    }

    #[tokio::test]
    async fn sampling_admits_roughly_the_requested_fraction() {
        let store = seeded(20_000);
        let h = harness(store, 10);
        read_range(0, &h.ctx, KeyRange::all()).await.unwrap();

        let stat = h.stats_rx.recv().unwrap();
        assert_eq!(stat.keys_read, 20_000);

        let segments = h.results.lock().snapshot();
        let rows = segments[0].row_count;
        assert!((1_000..=3_000).contains(&rows), "sampled {rows} of 20000");

        // Saved bytes track the sampled fraction of seen bytes.
        let ratio = stat.bytes_saved as f64 / stat.bytes_seen as f64;
        assert!(ratio > 0.05 && ratio < 0.20, "ratio {ratio}");

        let records = decode_segment(&h.dir, &segments[0].file_name);
        assert_eq!(records.len() as i64, rows);
    }

    #[tokio::test]
    async fn text_format_writes_keys_only() {
        let store = seeded(5);
        let dir = TempDir::new().unwrap();
        let results = Arc::new(Mutex::new(ResultsRegistry::default()));
        let (stats_tx, _stats_rx) = flume::bounded(16);
        let ctx = ReaderCtx {
            db: Arc::new(store),
            target_url: dir.path().to_str().unwrap().to_string(),
            compress: false,
            read_percent: 100,
            format: ExportFormat::Text,
            stats_tx,
            results: Arc::clone(&results),
        };
        read_range(0, &ctx, KeyRange::all()).await.unwrap();

        let segments = results.lock().snapshot();
        let text = std::fs::read_to_string(dir.path().join(&segments[0].file_name)).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "k000000");
        assert!(!text.contains("v000000"));
    }
}
