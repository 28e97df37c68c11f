// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `kvlift`: bulk-export the contents of a partitioned KV store.
//!
//! `serve` runs the per-node agent, `export` runs the coordinator against a
//! cluster of agents, and `verify` decodes archive files produced by an
//! earlier export.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use kvlift_export::client::{Exporter, ExporterOptsBuilder};
use kvlift_export::server::{ExportServer, TlsIdentity};

mod verify;

#[derive(Parser)]
#[command(name = "kvlift", version, about = "Bulk export for partitioned KV stores", long_about = None)]
struct Cli {
    /// Cluster url, e.g. `mem:` for the in-memory development store.
    #[arg(long, global = true, default_value = "mem:")]
    store: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the per-node export agent.
    Serve {
        /// gRPC bind port.
        #[arg(short, long, default_value = "4500")]
        port: u16,

        /// PEM server certificate; plaintext (dev only) when omitted.
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// PEM private key for --cert.
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },

    /// Export every key and value to archive files.
    Export {
        /// Target url: a directory path, file://, s3:// or azure://.
        #[arg(short, long)]
        target: String,

        /// Agent gRPC port on every storage host.
        #[arg(short, long, default_value = "4500")]
        port: u16,

        /// CA bundle for TLS towards the agents.
        #[arg(long)]
        ca: Option<PathBuf>,

        /// Server-name override for TLS verification.
        #[arg(long)]
        tls_domain: Option<String>,

        /// Reader workers per agent session.
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Sampling percentage in [0, 100].
        #[arg(long, default_value = "100")]
        sample: i32,

        /// Compress archive segments.
        #[arg(long)]
        compress: bool,

        /// Record format: `archive` or `text` (keys only).
        #[arg(long, default_value = "archive")]
        format: String,

        /// Download finalized files from the agents into this directory
        /// (file-backed targets only).
        #[arg(long)]
        collect: Option<PathBuf>,

        /// Plan the export without moving any data.
        #[arg(long)]
        dryrun: bool,

        /// Skip replica locality lookup and only report the keyspace
        /// tiling; nothing is exported.
        #[arg(long)]
        no_locality: bool,
    },

    /// Decode archive files and report their contents.
    Verify {
        /// Archive files (.records, optionally gzipped).
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port, cert, key } => serve(&cli.store, port, cert, key).await,
        Command::Export {
            target,
            port,
            ca,
            tls_domain,
            threads,
            sample,
            compress,
            format,
            collect,
            dryrun,
            no_locality,
        } => {
            let db = kvlift_store::connect(&cli.store)?;
            let opts = ExporterOptsBuilder::default()
                .target_url(target)
                .grpc_port(port)
                .ca_file(ca)
                .tls_domain(tls_domain)
                .reader_threads(threads)
                .read_percent(sample)
                .compress(compress)
                .export_format(format)
                .collect_dir(collect)
                .dry_run(dryrun)
                .skip_host_resolution(no_locality)
                .build()
                .context("invalid export options")?;
            Exporter::new(db, opts).run().await
        }
        Command::Verify { files } => verify::run(&files),
    }
}

async fn serve(
    store: &str,
    port: u16,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> anyhow::Result<()> {
    let db = kvlift_store::connect(store)?;
    let mut server = ExportServer::new(db);
    if let (Some(cert), Some(key)) = (cert, key) {
        server = server.with_tls(TlsIdentity {
            cert_pem: std::fs::read(&cert)
                .with_context(|| format!("unable to read certificate {}", cert.display()))?,
            key_pem: std::fs::read(&key)
                .with_context(|| format!("unable to read private key {}", key.display()))?,
        });
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            signal_cancel.cancel();
        }
    });

    server.serve(port, cancel).await
}
