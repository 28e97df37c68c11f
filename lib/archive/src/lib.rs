// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Append-only archive files for bulk key-value export.
//!
//! An [`ArchiveSink`] is a byte sink with an internal rotation policy: bytes
//! go in, finalized segments come out on [`ArchiveSink::close`]. The record
//! layout inside `archive`-format files is defined in [`record`];
//! text-format files carry newline-terminated keys and need no codec.
//!
//! Backends are selected by target-url scheme. Local paths and `file://`
//! urls are served by [`file::FileArchive`]; remote object-store backends
//! (`s3://`, `azure://`) are external and rejected here.

pub mod file;
pub mod record;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("key length {0} exceeds the record format maximum {max}", max = record::MAX_KEY_LEN)]
    KeyTooLong(usize),

    #[error("value length {0} exceeds the record format maximum {max}", max = record::MAX_VALUE_LEN)]
    ValueTooLong(usize),

    #[error("no archive backend for target url: {0}")]
    UnsupportedTarget(String),

    #[error("archive i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata for one finalized archive file.
///
/// `key_range` and `row_count` are stamped by the reader that owned the
/// writer; the backend fills in everything else at finalization time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub file_name: String,
    pub key_range: String,
    pub content_size: u64,
    pub row_count: i64,
    pub checksum: String,
    /// True when the segment exists only as metadata (e.g. an object-store
    /// upload with no local file) and cannot be streamed back.
    pub shell_only: bool,
    pub chunks_count: u32,
}

#[derive(Debug, Clone)]
pub struct ArchiveOpts {
    pub compress: bool,
    /// A segment is finalized and a new one started once it grows past this
    /// size. The export readers open one writer per key range, so with the
    /// default threshold most ranges produce exactly one segment.
    pub max_segment_bytes: u64,
    pub file_prefix: String,
}

impl Default for ArchiveOpts {
    fn default() -> Self {
        Self {
            compress: false,
            max_segment_bytes: 1 << 30,
            file_prefix: "kv".to_string(),
        }
    }
}

/// Append-only archive writer.
///
/// Writes are buffered; `rotate` finalizes the current file and starts a new
/// one; `close` finalizes everything and reports the produced segments.
pub trait ArchiveSink: Send {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ArchiveError>;
    fn rotate(&mut self) -> Result<(), ArchiveError>;
    fn close(self: Box<Self>) -> Result<Vec<SegmentInfo>, ArchiveError>;
}

impl std::fmt::Debug for dyn ArchiveSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ArchiveSink")
    }
}

/// Open an archive sink for a target url.
pub fn create(target_url: &str, opts: ArchiveOpts) -> Result<Box<dyn ArchiveSink>, ArchiveError> {
    match target_url.split_once("://") {
        None => Ok(Box::new(file::FileArchive::create(target_url, opts)?)),
        Some(("file", path)) => Ok(Box::new(file::FileArchive::create(path, opts)?)),
        Some(_) => Err(ArchiveError::UnsupportedTarget(target_url.to_string())),
    }
}
