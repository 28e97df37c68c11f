// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Local-filesystem archive backend.
//!
//! Segments are written under a `.partial` name and renamed into place at
//! finalization, so every file with a final name is complete. The checksum
//! is a streaming xxh3 over the logical (uncompressed) content, and
//! `content_size` counts the same bytes, so the metadata is independent of
//! the compression setting.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use uuid::Uuid;
use xxhash_rust::xxh3::Xxh3;

use crate::{ArchiveError, ArchiveOpts, ArchiveSink, SegmentInfo};

enum SegmentWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl SegmentWriter {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            SegmentWriter::Plain(w) => w.write_all(buf),
            SegmentWriter::Gzip(w) => w.write_all(buf),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            SegmentWriter::Plain(mut w) => w.flush(),
            SegmentWriter::Gzip(w) => w.finish()?.flush(),
        }
    }
}

struct OpenSegment {
    writer: SegmentWriter,
    hasher: Xxh3,
    file_name: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

pub struct FileArchive {
    dir: PathBuf,
    opts: ArchiveOpts,
    current: Option<OpenSegment>,
    finalized: Vec<SegmentInfo>,
}

impl FileArchive {
    pub fn create(dir: impl AsRef<Path>, opts: ArchiveOpts) -> Result<Self, ArchiveError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut archive = Self {
            dir,
            opts,
            current: None,
            finalized: Vec::new(),
        };
        archive.open_segment()?;
        Ok(archive)
    }

    fn open_segment(&mut self) -> Result<(), ArchiveError> {
        let suffix = if self.opts.compress { ".records.gz" } else { ".records" };
        let file_name = format!("{}-{}{}", self.opts.file_prefix, Uuid::new_v4(), suffix);
        let final_path = self.dir.join(&file_name);
        let tmp_path = self.dir.join(format!("{file_name}.partial"));
        let file = BufWriter::new(File::create(&tmp_path)?);
        let writer = if self.opts.compress {
            SegmentWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            SegmentWriter::Plain(file)
        };
        self.current = Some(OpenSegment {
            writer,
            hasher: Xxh3::new(),
            file_name,
            tmp_path,
            final_path,
            bytes_written: 0,
        });
        Ok(())
    }

    fn finalize_segment(&mut self) -> Result<(), ArchiveError> {
        let Some(segment) = self.current.take() else {
            return Ok(());
        };
        segment.writer.finish()?;
        fs::rename(&segment.tmp_path, &segment.final_path)?;
        tracing::debug!(
            file = %segment.file_name,
            bytes = segment.bytes_written,
            "finalized archive segment"
        );
        self.finalized.push(SegmentInfo {
            file_name: segment.file_name,
            key_range: String::new(),
            content_size: segment.bytes_written,
            row_count: 0,
            checksum: format!("{:016x}", segment.hasher.digest()),
            shell_only: false,
            chunks_count: 1,
        });
        Ok(())
    }
}

impl ArchiveSink for FileArchive {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ArchiveError> {
        let rotate_due = self
            .current
            .as_ref()
            .is_some_and(|s| {
                s.bytes_written > 0
                    && s.bytes_written + buf.len() as u64 > self.opts.max_segment_bytes
            });
        if rotate_due {
            self.rotate()?;
        }
        if self.current.is_none() {
            self.open_segment()?;
        }
        let Some(segment) = self.current.as_mut() else {
            return Err(ArchiveError::Io(std::io::Error::other("archive closed")));
        };
        segment.writer.write_all(buf)?;
        segment.hasher.update(buf);
        segment.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn rotate(&mut self) -> Result<(), ArchiveError> {
        self.finalize_segment()
    }

    fn close(mut self: Box<Self>) -> Result<Vec<SegmentInfo>, ArchiveError> {
        self.finalize_segment()?;
        Ok(std::mem::take(&mut self.finalized))
    }
}
