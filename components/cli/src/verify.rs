// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Archive verifier: decode record files and report what they hold.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::BytesMut;
use flate2::read::GzDecoder;
use tokio_util::codec::Decoder;
use tracing::{info, warn};

use kvlift_archive::record::{RecordCodec, SUSPICIOUS_KEY_LEN};

pub fn run(files: &[PathBuf]) -> anyhow::Result<()> {
    anyhow::ensure!(!files.is_empty(), "no files to verify");

    let mut total_records: u64 = 0;
    for file in files {
        total_records += verify_file(file)?;
    }
    info!(files = files.len(), records = total_records, "verification complete");
    Ok(())
}

fn verify_file(path: &Path) -> anyhow::Result<u64> {
    let raw = read_maybe_gzipped(path)?;
    let mut buf = BytesMut::from(&raw[..]);
    let mut codec = RecordCodec::new();

    let mut records: u64 = 0;
    let mut key_bytes: u64 = 0;
    let mut value_bytes: u64 = 0;
    let mut suspicious: u64 = 0;
    while let Some((key, value)) = codec
        .decode(&mut buf)
        .with_context(|| format!("corrupt record in {}", path.display()))?
    {
        records += 1;
        key_bytes += key.len() as u64;
        value_bytes += value.len() as u64;
        if key.len() > SUSPICIOUS_KEY_LEN {
            suspicious += 1;
        }
    }
    anyhow::ensure!(
        buf.is_empty(),
        "{} ends mid-record ({} trailing bytes)",
        path.display(),
        buf.len()
    );

    if suspicious > 0 {
        warn!(file = %path.display(), suspicious, "records with unusually long keys");
    }
    info!(
        file = %path.display(),
        records,
        key_bytes,
        value_bytes,
        "archive file ok"
    );
    Ok(records)
}

fn read_maybe_gzipped(path: &Path) -> anyhow::Result<Vec<u8>> {
    let raw = std::fs::read(path).with_context(|| format!("unable to read {}", path.display()))?;
    if path.extension().is_some_and(|e| e == "gz") {
        let mut decoded = Vec::new();
        GzDecoder::new(&raw[..])
            .read_to_end(&mut decoded)
            .with_context(|| format!("unable to decompress {}", path.display()))?;
        Ok(decoded)
    } else {
        Ok(raw)
    }
}
