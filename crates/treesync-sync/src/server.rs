//! Sync server
//!
//! Serves one directory tree to any number of clients over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//!  peer A ──read loop──┐                      ┌──→ disk
//!  peer B ──read loop──┼──→ apply queue ──→ processor
//!  peer C ──read loop──┘   (bounded FIFO)     └──→ broadcast to every peer
//!                                                  except the sender
//! ```
//!
//! Each accepted peer gets the current manifest, then its read loop answers
//! file requests directly and pushes file operations onto the apply queue.
//! The manifest is built, sent and the peer registered while the disk lock is
//! held, so every operation either appears in the manifest or is broadcast to
//! the peer after it.
//! A single processor drains the queue, so every operation is applied and
//! broadcast in one global order. An operation is applied to the server's own
//! disk before it is broadcast; if the apply fails it is not broadcast.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use treesync_core::config::{ServerConfig, SYNC_ENDPOINT_PATH};
use treesync_core::paths::normalize;
use treesync_core::protocol::{
    Envelope, FileContentMessage, FileOperation, ManifestMessage, ProtocolError,
};
use treesync_core::{build_manifest, PathIgnorer};
use uuid::Uuid;

use crate::connection::{decode_message, Connection};
use crate::filesystem::{apply_operation, read_file};
use crate::{prepare_sync_dir, SyncError};

/// How long shutdown waits for peer tasks before aborting them
const PEER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Connected peers keyed by their connection id
pub type ConnectionRegistry = DashMap<Uuid, Arc<Connection>>;

/// An operation waiting in the apply queue, tagged with the peer that sent it
#[derive(Debug, Clone)]
pub(crate) struct OperationEnvelope {
    pub(crate) sender: Uuid,
    pub(crate) op: FileOperation,
}

/// State shared by the accept loop, every read loop and the processor
#[derive(Debug)]
pub(crate) struct ServerContext {
    pub(crate) root: PathBuf,
    pub(crate) ignorer: Arc<PathIgnorer>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) disk_lock: Mutex<()>,
}

/// The sync server
pub struct Server {
    config: ServerConfig,
    ignorer: Arc<PathIgnorer>,
    registry: Arc<ConnectionRegistry>,
}

impl Server {
    pub fn new(config: ServerConfig, ignorer: PathIgnorer) -> Self {
        Self::with_registry(config, ignorer, Arc::new(DashMap::new()))
    }

    /// Creates a server that registers its peers in `registry`.
    pub fn with_registry(
        config: ServerConfig,
        ignorer: PathIgnorer,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            config,
            ignorer: Arc::new(ignorer),
            registry,
        }
    }

    /// Prepares the sync directory, binds the configured address and serves
    /// until `cancel` fires.
    ///
    /// # Errors
    /// Returns a setup error if the directory cannot be created or the
    /// address cannot be bound.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        let root = prepare_sync_dir(&self.config.directory).await?;

        let address = self.config.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| SyncError::Bind { address, source })?;

        self.serve_prepared(root, listener, cancel).await
    }

    /// Serves on an already bound listener until `cancel` fires.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        let root = prepare_sync_dir(&self.config.directory).await?;
        self.serve_prepared(root, listener, cancel).await
    }

    async fn serve_prepared(
        &self,
        root: PathBuf,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        let ctx = Arc::new(ServerContext {
            root,
            ignorer: Arc::clone(&self.ignorer),
            registry: Arc::clone(&self.registry),
            disk_lock: Mutex::new(()),
        });

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let processor = tokio::spawn(run_processor(
            Arc::clone(&ctx),
            queue_rx,
            cancel.clone(),
        ));

        info!(
            address = %listener.local_addr()?,
            directory = %ctx.root.display(),
            endpoint = SYNC_ENDPOINT_PATH,
            "Sync server listening"
        );

        let mut peers = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = peers.join_next(), if !peers.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        peers.spawn(handle_connection(
                            stream,
                            addr,
                            Arc::clone(&ctx),
                            queue_tx.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        info!("Shutting down sync server");
        drop(listener);
        let drained = tokio::time::timeout(PEER_SHUTDOWN_GRACE, async {
            while peers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = peers.len(), "Peers did not stop in time, aborting them");
            peers.shutdown().await;
        }
        drop(queue_tx);
        processor.await?;
        info!("Sync server stopped");
        Ok(())
    }
}

/// Rejects handshakes for any path other than the sync endpoint.
#[allow(clippy::result_large_err)]
fn check_endpoint(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == SYNC_ENDPOINT_PATH {
        return Ok(response);
    }
    debug!(path = %request.uri().path(), "Rejecting handshake for unknown path");
    let mut rejection = ErrorResponse::new(Some("not found".to_string()));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    queue: mpsc::Sender<OperationEnvelope>,
    cancel: CancellationToken,
) {
    let handshake = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(addr = %addr, "Shutting down before handshake completed");
            return;
        }
        handshake = tokio_tungstenite::accept_hdr_async(stream, check_endpoint) => handshake,
    };
    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            warn!(addr = %addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (sink, mut frames) = ws.split();
    let conn = Arc::new(Connection::new(sink));
    let id = Uuid::new_v4();

    let admitted = tokio::select! {
        _ = cancel.cancelled() => return,
        admitted = admit_peer(&ctx, id, &conn) => admitted,
    };
    if let Err(e) = admitted {
        warn!(peer = %id, error = %e, "Failed to send manifest, dropping peer");
        return;
    }
    info!(peer = %id, addr = %addr, peers = ctx.registry.len(), "Peer connected");

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                conn.close().await;
                break;
            }
            frame = frames.next() => frame,
        };

        let message = match frame {
            None => break,
            Some(Err(e)) => {
                debug!(peer = %id, error = %e, "Read failed");
                break;
            }
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(message)) => message,
        };

        let envelope = match decode_message(&message) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(peer = %id, kind = %kind, "Discarding message of unknown type");
                continue;
            }
            Err(e) => {
                warn!(peer = %id, error = %e, "Discarding malformed message");
                continue;
            }
        };

        match envelope {
            Envelope::FileRequest(request) => {
                let served = tokio::select! {
                    _ = cancel.cancelled() => break,
                    served = serve_file_request(&ctx, &conn, id, request.paths) => served,
                };
                if let Err(e) = served {
                    debug!(peer = %id, error = %e, "Peer went away while serving files");
                    break;
                }
            }
            Envelope::FileOperation(mut op) => {
                match normalize(&op.path) {
                    Ok(path) => op.path = path,
                    Err(e) => {
                        warn!(peer = %id, path = %op.path, error = %e, "Dropping operation with invalid path");
                        continue;
                    }
                }
                if ctx.ignorer.is_ignored(&op.path) {
                    debug!(peer = %id, path = %op.path, "Dropping operation on ignored path");
                    continue;
                }
                debug!(peer = %id, path = %op.path, op = %op.op, "Queueing operation");
                if queue.send(OperationEnvelope { sender: id, op }).await.is_err() {
                    // Processor is gone; we are shutting down
                    break;
                }
            }
            other => {
                warn!(peer = %id, kind = other.kind(), "Ignoring unexpected message from peer");
            }
        }
    }

    ctx.registry.remove(&id);
    info!(peer = %id, peers = ctx.registry.len(), "Peer disconnected");
}

/// Sends the manifest and registers the peer for broadcasts.
///
/// Holding the disk lock keeps the processor from applying anything between
/// the scan and the registration.
async fn admit_peer(
    ctx: &ServerContext,
    id: Uuid,
    conn: &Arc<Connection>,
) -> Result<(), SyncError> {
    let _disk = ctx.disk_lock.lock().await;
    send_manifest(ctx, conn).await?;
    ctx.registry.insert(id, Arc::clone(conn));
    Ok(())
}

async fn send_manifest(ctx: &ServerContext, conn: &Connection) -> Result<(), SyncError> {
    let root = ctx.root.clone();
    let ignorer = Arc::clone(&ctx.ignorer);
    let scan = tokio::task::spawn_blocking(move || build_manifest(&root, &ignorer)).await??;

    for err in &scan.errors {
        warn!(error = %err, "Skipping entry in manifest");
    }
    debug!(files = scan.manifest.len(), "Sending manifest");

    conn.send(&Envelope::Manifest(ManifestMessage {
        files: scan.manifest,
    }))
    .await
}

/// Answers a file request in request order.
///
/// Ignored and unreadable paths are skipped; only a failed send is an error.
async fn serve_file_request(
    ctx: &ServerContext,
    conn: &Connection,
    peer: Uuid,
    paths: Vec<String>,
) -> Result<(), SyncError> {
    debug!(peer = %peer, count = paths.len(), "Serving file request");

    for path in paths {
        if ctx.ignorer.is_ignored(&path) {
            debug!(peer = %peer, path = %path, "Not serving ignored path");
            continue;
        }
        let content = match read_file(&ctx.root, &path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(peer = %peer, path = %path, error = %e, "Skipping requested file");
                continue;
            }
        };
        conn.send(&Envelope::FileContent(FileContentMessage { path, content }))
            .await?;
    }
    Ok(())
}

// ============================================================================
// Apply-queue processor
// ============================================================================

async fn run_processor(
    ctx: Arc<ServerContext>,
    mut queue: mpsc::Receiver<OperationEnvelope>,
    cancel: CancellationToken,
) {
    debug!("Apply-queue processor started");
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.recv() => next,
        };
        match next {
            Some(envelope) => process_operation(&ctx, envelope).await,
            None => break,
        }
    }
    debug!("Apply-queue processor stopped");
}

/// Applies one queued operation to disk, then relays it to every peer except
/// its sender.
pub(crate) async fn process_operation(ctx: &ServerContext, envelope: OperationEnvelope) {
    let OperationEnvelope { sender, op } = envelope;

    let applied = {
        let _disk = ctx.disk_lock.lock().await;
        apply_operation(&ctx.root, &op).await
    };
    if let Err(e) = applied {
        error!(
            peer = %sender,
            path = %op.path,
            op = %op.op,
            error = %e,
            "Failed to apply operation; not broadcasting"
        );
        return;
    }

    let text = match Envelope::from(op).encode() {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "Failed to encode operation for broadcast");
            return;
        }
    };

    // Snapshot the registry so no shard lock is held across a send
    let targets: Vec<(Uuid, Arc<Connection>)> = ctx
        .registry
        .iter()
        .filter(|entry| *entry.key() != sender)
        .map(|entry| (*entry.key(), Arc::clone(entry.value())))
        .collect();

    for (peer, conn) in targets {
        if let Err(e) = conn.send_encoded(text.clone()).await {
            warn!(peer = %peer, error = %e, "Broadcast to peer failed");
        }
    }
}
