// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed bulk-export engine.
//!
//! A coordinator discovers how the cluster's keyspace is sharded
//! ([`finder`]), assigns each shard range to the least-loaded replica host
//! ([`plan`]), and drives one export session per agent over gRPC
//! ([`client`]). Each agent runs the sessioned service in [`server`]: ranges
//! stream into a pool of reader workers ([`session`]) that walk the store
//! under its per-transaction wall-clock limit and append the observed pairs
//! to archive files.

pub mod client;
pub mod finder;
pub mod plan;
mod reader;
pub mod server;
pub mod session;

pub mod proto {
    tonic::include_proto!("kvlift.export.v1");
}

use kvlift_archive::ArchiveError;
use kvlift_store::StoreError;
use tonic::Status;

/// Hard cap on a single gRPC message.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Block size for streaming finalized files back to the coordinator. Stays
/// well under [`MAX_MESSAGE_BYTES`].
pub const FILE_BLOCK_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The registry has no available entry for this id: either it never
    /// existed, it already ended, or another RPC has it checked out.
    #[error("unknown session id or session in use: {0}")]
    Busy(String),

    #[error("a single export stream cannot carry multiple session ids (have {current}, got {got})")]
    StreamMismatch { current: String, got: String },

    #[error("session is shutting down; range inbox is closed")]
    InboxClosed,

    #[error("reader worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("the tuple ({target_url}, {file_name}) is not part of the result set")]
    NotAResultFile {
        target_url: String,
        file_name: String,
    },

    #[error("file transfer is only implemented for file:// targets, got {0}")]
    UnsupportedTransferTarget(String),
}

impl From<SessionError> for Status {
    fn from(err: SessionError) -> Self {
        match &err {
            SessionError::Busy(_) => Status::not_found(err.to_string()),
            SessionError::StreamMismatch { .. } => Status::invalid_argument(err.to_string()),
            SessionError::NotAResultFile { .. } => Status::failed_precondition(err.to_string()),
            SessionError::UnsupportedTransferTarget(_) => Status::unimplemented(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}
