// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Agent-side gRPC service.
//!
//! Sessions live in a concurrent registry keyed by session id. Session
//! RPCs *check out* their session with an atomic remove-if-present and
//! release it by inserting it back; while checked out, no other RPC can
//! touch it. EndExportSession is the one call that never releases: the
//! session is finalized and dropped. This discipline replaces per-session
//! locking.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures::Stream;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use kvlift_store::{Database, KeyRange};

use crate::proto::export_service_server::{ExportService, ExportServiceServer};
use crate::proto::{
    ExportSummary, ExportTarget, FileBlock, FileRequest, FinalizedFile, PingRequest,
    PingResponse, RangeRequest, SessionRef, SessionResponse, SessionStatus,
};
use crate::session::{ExportFormat, ExportSession, SessionSpec};
use crate::{SessionError, FILE_BLOCK_BYTES, MAX_MESSAGE_BYTES};

/// PEM-encoded server credentials.
pub struct TlsIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

pub struct ExportServer {
    db: Arc<dyn Database>,
    tls: Option<TlsIdentity>,
}

impl ExportServer {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db, tls: None }
    }

    pub fn with_tls(mut self, tls: TlsIdentity) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Serve on `0.0.0.0:bind_port` until the token is cancelled.
    pub async fn serve(self, bind_port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{bind_port}").parse()?;
        let mut builder = Server::builder();
        if let Some(tls) = &self.tls {
            builder = builder.tls_config(
                ServerTlsConfig::new().identity(Identity::from_pem(&tls.cert_pem, &tls.key_pem)),
            )?;
        } else {
            warn!("serving without TLS; configure --cert/--key for production clusters");
        }
        info!(%addr, "export agent listening");
        builder
            .add_service(self.service())
            .serve_with_shutdown(addr, cancel.cancelled())
            .await?;
        info!("export agent shut down");
        Ok(())
    }

    /// Serve on a pre-bound listener. Used by tests that need an ephemeral
    /// port; TLS is not applied on this path.
    pub async fn serve_with_listener(
        self,
        listener: tokio::net::TcpListener,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let incoming = TcpListenerStream::new(listener);
        Server::builder()
            .add_service(self.service())
            .serve_with_incoming_shutdown(incoming, cancel.cancelled())
            .await?;
        Ok(())
    }

    fn service(&self) -> ExportServiceServer<ExportServiceImpl> {
        ExportServiceServer::new(ExportServiceImpl {
            db: Arc::clone(&self.db),
            sessions: Arc::new(DashMap::new()),
        })
        .max_decoding_message_size(MAX_MESSAGE_BYTES)
        .max_encoding_message_size(MAX_MESSAGE_BYTES)
    }
}

struct ExportServiceImpl {
    db: Arc<dyn Database>,
    sessions: Arc<DashMap<String, ExportSession>>,
}

impl ExportServiceImpl {
    /// Atomic remove-if-present: the caller owns the session until it is
    /// released or dropped.
    fn check_out(&self, session_id: &str) -> Result<ExportSession, SessionError> {
        self.sessions
            .remove(session_id)
            .map(|(_, session)| session)
            .ok_or_else(|| SessionError::Busy(session_id.to_string()))
    }

    fn release(&self, session: ExportSession) {
        self.sessions
            .insert(session.session_id().to_string(), session);
    }
}

fn to_finalized_file(segment: &kvlift_archive::SegmentInfo) -> FinalizedFile {
    FinalizedFile {
        file_name: segment.file_name.clone(),
        key_range: segment.key_range.clone(),
        content_size: segment.content_size as i64,
        row_count: segment.row_count,
        checksum: segment.checksum.clone(),
        shell_only: segment.shell_only,
        chunks_count: segment.chunks_count as i32,
    }
}

/// Resolve a target url to a local directory, or reject non-file schemes.
fn local_target_dir(target_url: &str) -> Result<PathBuf, SessionError> {
    if let Some(path) = target_url.strip_prefix("file://") {
        Ok(PathBuf::from(path))
    } else if target_url.contains("://") {
        Err(SessionError::UnsupportedTransferTarget(
            target_url.to_string(),
        ))
    } else {
        Ok(PathBuf::from(target_url))
    }
}

#[tonic::async_trait]
impl ExportService for ExportServiceImpl {
    async fn ping(
        &self,
        _request: Request<PingRequest>,
    ) -> Result<Response<PingResponse>, Status> {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Ok(Response::new(PingResponse { ts }))
    }

    async fn start_export_session(
        &self,
        request: Request<ExportTarget>,
    ) -> Result<Response<SessionResponse>, Status> {
        let target = request.into_inner();
        let spec = SessionSpec {
            target_url: target.target_url,
            reader_threads: target.reader_threads.max(1) as usize,
            compress: target.compress,
            read_percent: target.read_percent.clamp(0, 100) as u32,
            export_format: ExportFormat::from_tag(&target.export_format),
        };
        let session = ExportSession::new(Arc::clone(&self.db), spec);
        let session_id = session.session_id().to_string();
        self.sessions.insert(session_id.clone(), session);
        info!(session_id = %session_id, "created export session");
        Ok(Response::new(SessionResponse {
            session_id,
            status: SessionStatus::Success as i32,
            finalized_files: Vec::new(),
        }))
    }

    async fn export(
        &self,
        request: Request<Streaming<RangeRequest>>,
    ) -> Result<Response<ExportSummary>, Status> {
        let mut stream = request.into_inner();
        let mut active: Option<ExportSession> = None;
        let mut current_id = String::new();
        let mut ranges_received: i64 = 0;

        loop {
            match stream.message().await {
                Ok(Some(req)) => {
                    if active.is_none() {
                        current_id = req.session_id.clone();
                        let session = self.check_out(&current_id).map_err(Status::from)?;
                        info!(session_id = %current_id, "export stream opened");
                        active = Some(session);
                    } else if req.session_id != current_id {
                        error!(
                            current_session_id = %current_id,
                            new_session_id = %req.session_id,
                            "export stream switched session ids"
                        );
                        if let Some(mut session) = active.take() {
                            let _ = session.finalize().await;
                        }
                        return Err(SessionError::StreamMismatch {
                            current: current_id,
                            got: req.session_id,
                        }
                        .into());
                    }

                    let Some(session) = active.as_ref() else {
                        continue;
                    };
                    debug!(
                        begin = %kvlift_store::printable(&req.begin),
                        end = %kvlift_store::printable(&req.end),
                        "queueing range"
                    );
                    if let Err(e) = session.send(KeyRange::new(req.begin, req.end)).await {
                        if let Some(mut session) = active.take() {
                            let _ = session.finalize().await;
                        }
                        return Err(e.into());
                    }
                    ranges_received += 1;
                }
                Ok(None) => break,
                Err(status) => {
                    error!(
                        session_id = %current_id,
                        error = %status,
                        "export stream receive failed"
                    );
                    if let Some(mut session) = active.take() {
                        let _ = session.finalize().await;
                    }
                    return Err(status);
                }
            }
        }

        // Clean half-close: the session goes back for StopExportSession.
        if let Some(session) = active.take() {
            self.release(session);
        }
        Ok(Response::new(ExportSummary {
            session_id: current_id,
            ranges_received,
        }))
    }

    async fn stop_export_session(
        &self,
        request: Request<SessionRef>,
    ) -> Result<Response<SessionResponse>, Status> {
        let req = request.into_inner();
        info!(session_id = %req.session_id, "received stop session");
        let mut session = self.check_out(&req.session_id).map_err(Status::from)?;

        match session.finalize().await {
            Ok(segments) => {
                let finalized_files = segments.iter().map(to_finalized_file).collect();
                self.release(session);
                info!(session_id = %req.session_id, "session drained");
                Ok(Response::new(SessionResponse {
                    session_id: req.session_id,
                    status: SessionStatus::Success as i32,
                    finalized_files,
                }))
            }
            Err(e) => {
                // A failed session is dropped outright; nothing left worth
                // transferring.
                error!(session_id = %req.session_id, error = %e, "session failed");
                Err(Status::from(e))
            }
        }
    }

    async fn end_export_session(
        &self,
        request: Request<SessionRef>,
    ) -> Result<Response<SessionResponse>, Status> {
        let req = request.into_inner();
        info!(session_id = %req.session_id, "received end session");
        let mut session = self.check_out(&req.session_id).map_err(Status::from)?;

        // Checked out and never released: the registry entry is gone for
        // good and the session drops here.
        let result = session.finalize().await;
        info!(session_id = %req.session_id, "released session resources");
        match result {
            Ok(segments) => Ok(Response::new(SessionResponse {
                session_id: req.session_id,
                status: SessionStatus::Success as i32,
                finalized_files: segments.iter().map(to_finalized_file).collect(),
            })),
            Err(e) => Err(Status::from(e)),
        }
    }

    type GetExportedFileStream =
        Pin<Box<dyn Stream<Item = Result<FileBlock, Status>> + Send>>;

    async fn get_exported_file(
        &self,
        request: Request<FileRequest>,
    ) -> Result<Response<Self::GetExportedFileStream>, Status> {
        let req = request.into_inner();
        let session = self.check_out(&req.session_id).map_err(Status::from)?;

        if !session.is_result_file(&req.target_url, &req.file_name) {
            self.release(session);
            return Err(SessionError::NotAResultFile {
                target_url: req.target_url,
                file_name: req.file_name,
            }
            .into());
        }
        let dir = match local_target_dir(&req.target_url) {
            Ok(dir) => dir,
            Err(e) => {
                self.release(session);
                return Err(e.into());
            }
        };
        let path = dir.join(&req.file_name);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                self.release(session);
                return Err(Status::internal(format!(
                    "error opening node-local file {}: {e}",
                    path.display()
                )));
            }
        };

        // The session stays checked out for the lifetime of the stream so
        // nobody can remove the file underneath it; the send task releases
        // it when the last block is out.
        let (tx, rx) = mpsc::channel::<Result<FileBlock, Status>>(4);
        let sessions = Arc::clone(&self.sessions);
        let session_id = req.session_id.clone();
        let file_name = req.file_name.clone();
        info!(session_id = %session_id, file = %file_name, "streaming exported file");
        tokio::spawn(async move {
            if let Err(e) = stream_file_blocks(file, &file_name, &tx).await {
                debug!(file = %file_name, error = %e, "file stream ended early");
                let _ = tx
                    .send(Err(Status::internal(format!(
                        "error streaming {file_name}: {e}"
                    ))))
                    .await;
            }
            sessions.insert(session_id, session);
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn remove_exported_file(
        &self,
        request: Request<FileRequest>,
    ) -> Result<Response<FileRequest>, Status> {
        let req = request.into_inner();
        let session = self.check_out(&req.session_id).map_err(Status::from)?;

        let outcome = remove_result_file(&session, &req).await;
        self.release(session);
        match outcome {
            Ok(()) => Ok(Response::new(req)),
            Err(status) => Err(status),
        }
    }
}

async fn remove_result_file(session: &ExportSession, req: &FileRequest) -> Result<(), Status> {
    if !session.is_result_file(&req.target_url, &req.file_name) {
        return Err(SessionError::NotAResultFile {
            target_url: req.target_url.clone(),
            file_name: req.file_name.clone(),
        }
        .into());
    }
    let dir = local_target_dir(&req.target_url).map_err(Status::from)?;
    let path = dir.join(&req.file_name);
    tokio::fs::remove_file(&path)
        .await
        .map_err(|e| Status::internal(format!("error removing file {}: {e}", path.display())))?;
    info!(file = %req.file_name, "removed exported file");
    Ok(())
}

async fn stream_file_blocks(
    mut file: tokio::fs::File,
    file_name: &str,
    tx: &mpsc::Sender<Result<FileBlock, Status>>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; FILE_BLOCK_BYTES];
    let mut block_num: i32 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        block_num += 1;
        tx.send(Ok(FileBlock {
            file_name: file_name.to_string(),
            block_num,
            block_data: buf[..n].to_vec(),
        }))
        .await
        .map_err(|_| anyhow::anyhow!("block receiver dropped"))?;
    }
    Ok(())
}
