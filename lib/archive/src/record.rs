// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-width archive record codec.
//!
//! Wire format, little-endian, no file header or trailer:
//! ```text
//! [u32 LE length word: bits 31..18 = keyLen (14 bits), bits 17..0 = valLen (18 bits)]
//! [key bytes][value bytes]
//! ```
//!
//! A stream of records terminates on clean EOF at a record boundary. The
//! decoder keeps state across partial buffers so it can be driven by a
//! `FramedRead` or fed raw chunks.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

use crate::ArchiveError;

/// Maximum key length the 14-bit length field can carry.
pub const MAX_KEY_LEN: usize = (1 << 14) - 1; // 16383
/// Maximum value length the 18-bit length field can carry.
pub const MAX_VALUE_LEN: usize = (1 << 18) - 1; // 262143

/// Keys longer than this are legal but unexpected in practice; the decoder
/// logs them so a corrupted stream is noticed early.
pub const SUSPICIOUS_KEY_LEN: usize = 1000;

const LEN_WORD_SIZE: usize = 4;
const VALUE_LEN_BITS: u32 = 18;
const VALUE_LEN_MASK: u32 = (1 << VALUE_LEN_BITS) - 1;

/// Append one encoded record to `buf`, returning the encoded size.
pub fn encode_record(buf: &mut BytesMut, key: &[u8], value: &[u8]) -> Result<usize, ArchiveError> {
    if key.len() > MAX_KEY_LEN {
        return Err(ArchiveError::KeyTooLong(key.len()));
    }
    if value.len() > MAX_VALUE_LEN {
        return Err(ArchiveError::ValueTooLong(value.len()));
    }

    let word = ((key.len() as u32) << VALUE_LEN_BITS) | value.len() as u32;
    buf.reserve(LEN_WORD_SIZE + key.len() + value.len());
    buf.extend_from_slice(&word.to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    Ok(LEN_WORD_SIZE + key.len() + value.len())
}

/// Encoded size of a record without building it.
pub fn encoded_len(key: &[u8], value: &[u8]) -> usize {
    LEN_WORD_SIZE + key.len() + value.len()
}

/// Stateful record decoder.
#[derive(Debug, Clone, Default)]
pub struct RecordCodec {
    state: DecodeState,
}

#[derive(Debug, Clone, Copy, Default)]
enum DecodeState {
    #[default]
    AwaitingLength,
    AwaitingData {
        key_len: usize,
        val_len: usize,
    },
}

impl RecordCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for RecordCodec {
    type Item = (Bytes, Bytes);
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::AwaitingLength => {
                    if src.len() < LEN_WORD_SIZE {
                        return Ok(None);
                    }
                    let word = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
                    let key_len = (word >> VALUE_LEN_BITS) as usize;
                    let val_len = (word & VALUE_LEN_MASK) as usize;
                    if key_len > SUSPICIOUS_KEY_LEN {
                        tracing::warn!(key_len, "suspicious record: key length over {SUSPICIOUS_KEY_LEN}");
                    }
                    src.advance(LEN_WORD_SIZE);
                    self.state = DecodeState::AwaitingData { key_len, val_len };
                }
                DecodeState::AwaitingData { key_len, val_len } => {
                    if src.len() < key_len + val_len {
                        return Ok(None);
                    }
                    let key = src.split_to(key_len).freeze();
                    let value = src.split_to(val_len).freeze();
                    self.state = DecodeState::AwaitingLength;
                    return Ok(Some((key, value)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_to_bytes(pairs: &[(&[u8], &[u8])]) -> BytesMut {
        let mut buf = BytesMut::new();
        for (k, v) in pairs {
            encode_record(&mut buf, k, v).unwrap();
        }
        buf
    }

    fn decode_all(buf: &mut BytesMut) -> Vec<(Bytes, Bytes)> {
        let mut codec = RecordCodec::new();
        let mut out = Vec::new();
        while let Some(rec) = codec.decode(buf).unwrap() {
            out.push(rec);
        }
        out
    }

    #[test]
    fn round_trip_preserves_pairs_in_order() {
        let pairs: Vec<(&[u8], &[u8])> = vec![
            (b"alpha", b"1"),
            (b"beta", b"two"),
            (b"gamma", b"\x00\x01\x02"),
        ];
        let mut buf = encode_to_bytes(&pairs);
        let decoded = decode_all(&mut buf);
        assert!(buf.is_empty());
        assert_eq!(decoded.len(), 3);
        for ((k, v), (dk, dv)) in pairs.iter().zip(&decoded) {
            assert_eq!(&dk[..], *k);
            assert_eq!(&dv[..], *v);
        }
    }

    #[test]
    fn length_word_layout() {
        let mut buf = BytesMut::new();
        let n = encode_record(&mut buf, b"key", b"value").unwrap();
        assert_eq!(n, 4 + 3 + 5);
        assert_eq!(n, encoded_len(b"key", b"value"));
        let word = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(word >> 18, 3);
        assert_eq!(word & ((1 << 18) - 1), 5);
        assert_eq!(&buf[4..7], b"key");
        assert_eq!(&buf[7..], b"value");
    }

    #[test]
    fn empty_value_is_legal() {
        let mut buf = encode_to_bytes(&[(b"k", b"")]);
        let decoded = decode_all(&mut buf);
        assert_eq!(decoded.len(), 1);
        assert_eq!(&decoded[0].0[..], b"k");
        assert!(decoded[0].1.is_empty());
    }

    #[test]
    fn maximum_lengths_round_trip() {
        let key = vec![b'k'; MAX_KEY_LEN];
        let value = vec![b'v'; MAX_VALUE_LEN];
        let mut buf = BytesMut::new();
        encode_record(&mut buf, &key, &value).unwrap();
        let decoded = decode_all(&mut buf);
        assert_eq!(decoded[0].0.len(), MAX_KEY_LEN);
        assert_eq!(decoded[0].1.len(), MAX_VALUE_LEN);
    }

    #[test]
    fn over_limit_lengths_are_rejected() {
        let mut buf = BytesMut::new();
        let key = vec![0u8; MAX_KEY_LEN + 1];
        assert!(matches!(
            encode_record(&mut buf, &key, b""),
            Err(ArchiveError::KeyTooLong(_))
        ));
        let value = vec![0u8; MAX_VALUE_LEN + 1];
        assert!(matches!(
            encode_record(&mut buf, b"k", &value),
            Err(ArchiveError::ValueTooLong(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_buffers_resume_decoding() {
        let mut full = encode_to_bytes(&[(b"resume-key", b"resume-value")]);
        let full = full.split().freeze();

        let mut codec = RecordCodec::new();
        let mut buf = BytesMut::new();

        // Partial length word.
        buf.extend_from_slice(&full[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Length word complete, data still short.
        buf.extend_from_slice(&full[2..8]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[8..]);
        let (k, v) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&k[..], b"resume-key");
        assert_eq!(&v[..], b"resume-value");
    }

    #[test]
    fn multiple_records_in_one_buffer() {
        let mut buf = encode_to_bytes(&[(b"a", b"A"), (b"b", b"B")]);
        let decoded = decode_all(&mut buf);
        assert_eq!(decoded.len(), 2);
        assert_eq!(&decoded[1].0[..], b"b");
    }
}
