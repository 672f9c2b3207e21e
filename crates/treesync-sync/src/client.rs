//! Sync client
//!
//! Mirrors a server's tree into a local directory and pushes local changes
//! back.
//!
//! ## Lifecycle
//!
//! 1. Register watches on the local tree and start the watch task.
//! 2. Dial the server. On failure wait the reconnect backoff and retry.
//! 3. On the server's manifest, reconcile in a background task: delete local
//!    extras and request whatever is missing or stale.
//! 4. Apply every `file_content` and `file_operation` the server pushes, under
//!    an echo-suppression permit for its path.
//! 5. On disconnect wait the backoff and go back to 2. The next manifest
//!    repairs anything missed while offline.
//!
//! Local changes detected while disconnected are dropped; reconnecting
//! reconciles against the server's tree, which is authoritative.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use treesync_core::config::ClientConfig;
use treesync_core::paths::{normalize, relative_slash_path};
use treesync_core::protocol::{Envelope, FileOperation, FileRequestMessage, ProtocolError};
use treesync_core::{build_manifest, Manifest, PathIgnorer};

use crate::connection::{decode_message, Connection};
use crate::echo::EchoGuard;
use crate::filesystem::{apply_operation, remove, write_file};
use crate::reconcile::plan_reconciliation;
use crate::watcher::{ChangeEvent, FileWatcher};
use crate::{prepare_sync_dir, SyncError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client behaviour, resolved from [`ClientConfig`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// WebSocket URL of the server's sync endpoint
    pub endpoint: String,
    pub directory: PathBuf,
    /// Delete local files the server does not have during reconciliation
    pub delete: bool,
    /// Log the reconciliation plan instead of executing it
    pub dry_run: bool,
    pub reconnect_backoff: Duration,
    pub echo_grace: Duration,
}

impl ClientOptions {
    /// # Errors
    /// Returns [`SyncError::DomainError`] if the server address is not a
    /// usable endpoint.
    pub fn from_config(config: &ClientConfig) -> Result<Self, SyncError> {
        Ok(Self {
            endpoint: config.endpoint()?.to_string(),
            directory: config.directory.clone(),
            delete: config.delete,
            dry_run: config.dry_run,
            reconnect_backoff: config.reconnect_backoff(),
            echo_grace: config.echo_grace(),
        })
    }
}

/// State shared by the receive loop, reconciliation and the watch task
#[derive(Debug)]
pub(crate) struct ClientContext {
    pub(crate) root: PathBuf,
    pub(crate) ignorer: PathIgnorer,
    pub(crate) echo: EchoGuard,
    pub(crate) delete: bool,
    pub(crate) dry_run: bool,
    pub(crate) connection: RwLock<Option<Arc<Connection>>>,
}

/// The sync client
pub struct Client {
    options: ClientOptions,
    ignorer: PathIgnorer,
}

impl Client {
    pub fn new(options: ClientOptions, ignorer: PathIgnorer) -> Self {
        Self { options, ignorer }
    }

    /// Runs until `cancel` fires, reconnecting after every disconnect.
    ///
    /// # Errors
    /// Returns a setup error if the sync directory cannot be prepared or the
    /// watcher cannot be started. Transport errors are retried.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        let root = prepare_sync_dir(&self.options.directory).await?;
        let ctx = Arc::new(ClientContext {
            root,
            ignorer: self.ignorer.clone(),
            echo: EchoGuard::new(self.options.echo_grace),
            delete: self.options.delete,
            dry_run: self.options.dry_run,
            connection: RwLock::new(None),
        });

        let (mut watcher, events) = FileWatcher::new()?;
        watcher.watch_tree(&ctx.root, |path| keep(&ctx, path))?;
        info!(
            directory = %ctx.root.display(),
            watched = watcher.watched_count(),
            "Watching local tree"
        );
        let watch_task = tokio::spawn(watch_loop(
            Arc::clone(&ctx),
            watcher,
            events,
            cancel.clone(),
        ));

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = connect(&self.options.endpoint) => connected,
            };

            match connected {
                Ok(ws) => {
                    info!(server = %self.options.endpoint, "Connected to sync server");
                    receive_loop(&ctx, ws, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(
                        retry_in = ?self.options.reconnect_backoff,
                        "Disconnected from sync server"
                    );
                }
                Err(e) => {
                    warn!(
                        server = %self.options.endpoint,
                        error = %e,
                        retry_in = ?self.options.reconnect_backoff,
                        "Failed to connect to sync server"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.reconnect_backoff) => {}
            }
        }

        watch_task.await?;
        info!("Sync client stopped");
        Ok(())
    }
}

/// Dials the server's sync endpoint.
async fn connect(endpoint: &str) -> Result<WsStream, SyncError> {
    let (ws, _response) = tokio_tungstenite::connect_async(endpoint).await?;
    Ok(ws)
}

fn keep(ctx: &ClientContext, path: &Path) -> bool {
    relative_slash_path(&ctx.root, path).is_some_and(|rel| !ctx.ignorer.is_ignored(&rel))
}

// ============================================================================
// Receive side
// ============================================================================

async fn receive_loop(ctx: &Arc<ClientContext>, ws: WsStream, cancel: &CancellationToken) {
    let (sink, mut frames) = ws.split();
    let conn = Arc::new(Connection::new(sink));
    *ctx.connection.write().await = Some(Arc::clone(&conn));

    let mut reconciliation: Option<JoinHandle<()>> = None;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                conn.close().await;
                break;
            }
            frame = frames.next() => frame,
        };

        let message = match frame {
            None | Some(Ok(Message::Close(_))) => break,
            Some(Err(e)) => {
                warn!(error = %e, "Read from sync server failed");
                break;
            }
            Some(Ok(message)) => message,
        };

        let envelope = match decode_message(&message) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(kind = %kind, "Discarding message of unknown type");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Discarding malformed message");
                continue;
            }
        };

        if let Envelope::Manifest(manifest) = envelope {
            if let Some(previous) = reconciliation.take() {
                previous.abort();
            }
            let ctx = Arc::clone(ctx);
            let conn = Arc::clone(&conn);
            reconciliation = Some(tokio::spawn(async move {
                if let Err(e) = handle_manifest(&ctx, &conn, manifest.files).await {
                    warn!(error = %e, "Initial reconciliation failed");
                }
            }));
        } else {
            apply_inbound(ctx, envelope).await;
        }
    }

    if let Some(task) = reconciliation {
        task.abort();
    }
    *ctx.connection.write().await = None;
}

/// Applies a pushed `file_content` or `file_operation` to the local tree.
pub(crate) async fn apply_inbound(ctx: &ClientContext, envelope: Envelope) {
    let (path, result) = match envelope {
        Envelope::FileContent(content) => {
            let Some(path) = accept_inbound_path(ctx, &content.path) else {
                return;
            };
            let _permit = ctx.echo.begin(&path);
            let result = write_file(&ctx.root, &path, &content.content).await;
            (path, result)
        }
        Envelope::FileOperation(mut op) => {
            let Some(path) = accept_inbound_path(ctx, &op.path) else {
                return;
            };
            op.path = path.clone();
            let _permit = ctx.echo.begin(&path);
            let result = apply_operation(&ctx.root, &op).await;
            (path, result)
        }
        other => {
            warn!(kind = other.kind(), "Ignoring unexpected message from server");
            return;
        }
    };

    match result {
        Ok(()) => debug!(path = %path, "Applied inbound change"),
        Err(e) => warn!(path = %path, error = %e, "Failed to apply inbound change"),
    }
}

fn accept_inbound_path(ctx: &ClientContext, raw: &str) -> Option<String> {
    let path = match normalize(raw) {
        Ok(path) => path,
        Err(e) => {
            warn!(path = %raw, error = %e, "Rejecting inbound change with invalid path");
            return None;
        }
    };
    if ctx.ignorer.is_ignored(&path) {
        debug!(path = %path, "Dropping inbound change on ignored path");
        return None;
    }
    Some(path)
}

/// Reconciles the local tree against the server's manifest.
#[instrument(skip_all, fields(server_files = server.len()))]
pub(crate) async fn handle_manifest(
    ctx: &ClientContext,
    conn: &Connection,
    server: Manifest,
) -> Result<(), SyncError> {
    let root = ctx.root.clone();
    let ignorer = ctx.ignorer.clone();
    let scan = tokio::task::spawn_blocking(move || build_manifest(&root, &ignorer)).await??;
    for err in &scan.errors {
        warn!(error = %err, "Skipping local entry");
    }

    // The client's own ignore list applies to what it asks for too
    let server: Manifest = server
        .iter()
        .filter(|(path, _)| !ctx.ignorer.is_ignored(path))
        .collect();
    let plan = plan_reconciliation(&server, &scan.manifest, ctx.delete);

    if plan.is_empty() {
        info!(files = server.len(), "Local tree already matches server");
        return Ok(());
    }

    if ctx.dry_run {
        for path in &plan.fetch {
            info!(path = %path, "[dry-run] would fetch");
        }
        for path in &plan.delete {
            info!(path = %path, "[dry-run] would delete");
        }
        info!(
            fetch = plan.fetch.len(),
            delete = plan.delete.len(),
            "[dry-run] reconciliation planned, nothing changed"
        );
        return Ok(());
    }

    for path in &plan.delete {
        // Written by an operation that arrived after the manifest
        if ctx.echo.is_suppressed(path) {
            debug!(path = %path, "Keeping freshly applied file");
            continue;
        }
        let _permit = ctx.echo.begin(path);
        match remove(&ctx.root, path).await {
            Ok(()) => debug!(path = %path, "Deleted local-only file"),
            Err(e) => warn!(path = %path, error = %e, "Failed to delete local-only file"),
        }
    }

    let fetch = plan.fetch.len();
    if fetch > 0 {
        conn.send(&Envelope::FileRequest(FileRequestMessage { paths: plan.fetch }))
            .await?;
    }

    info!(fetch, delete = plan.delete.len(), "Reconciliation started");
    Ok(())
}

// ============================================================================
// Watch side
// ============================================================================

async fn watch_loop(
    ctx: Arc<ClientContext>,
    mut watcher: FileWatcher,
    mut events: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let Err(e) = handle_change(&ctx, &mut watcher, event).await {
            warn!(error = %e, "Failed to propagate local change");
        }
    }
    debug!("Watch task stopped");
}

/// Turns one local filesystem event into outbound operations.
///
/// Suppressed events still update the watch set: a directory created by an
/// inbound apply must be watched for later local edits.
async fn handle_change(
    ctx: &ClientContext,
    watcher: &mut FileWatcher,
    event: ChangeEvent,
) -> Result<(), SyncError> {
    let Some(rel) = relative_slash_path(&ctx.root, event.path()) else {
        return Ok(());
    };
    if ctx.ignorer.is_ignored(&rel) {
        trace!(path = %rel, "Ignored path changed");
        return Ok(());
    }
    let suppressed = ctx.echo.is_suppressed(&rel);

    let (path, created) = match event {
        ChangeEvent::Deleted(path) => {
            if watcher.unwatch_tree(&path) {
                debug!(path = %rel, "Stopped watching removed directory");
            }
            if suppressed {
                debug!(path = %rel, "Suppressed echo of inbound removal");
                return Ok(());
            }
            return send_operation(ctx, FileOperation::remove(rel)).await;
        }
        ChangeEvent::Created(path) => (path, true),
        ChangeEvent::Modified(path) => (path, false),
    };

    let metadata = match tokio::fs::symlink_metadata(&path).await {
        Ok(m) => m,
        // Gone again; the matching delete event follows
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if metadata.file_type().is_symlink() {
        trace!(path = %rel, "Skipping symlink");
        return Ok(());
    }

    if metadata.is_dir() {
        if !created && watcher.is_watched(&path) {
            return Ok(());
        }
        let entries = watcher.watch_tree(&path, |p| keep(ctx, p))?;
        if suppressed {
            debug!(path = %rel, "Suppressed echo of inbound directory");
            return Ok(());
        }
        send_operation(ctx, FileOperation::create_dir(rel)).await?;

        // Contents that arrived before the watch was registered
        for entry in entries {
            let Some(rel) = relative_slash_path(&ctx.root, &entry.path) else {
                continue;
            };
            if ctx.echo.is_suppressed(&rel) {
                continue;
            }
            if entry.is_dir {
                send_operation(ctx, FileOperation::create_dir(rel)).await?;
            } else if let Some(content) = read_local(&entry.path).await? {
                send_operation(ctx, FileOperation::write(rel, content)).await?;
            }
        }
        return Ok(());
    }

    if suppressed {
        debug!(path = %rel, "Suppressed echo of inbound write");
        return Ok(());
    }
    match read_local(&path).await? {
        Some(content) => send_operation(ctx, FileOperation::write(rel, content)).await,
        None => Ok(()),
    }
}

async fn read_local(path: &Path) -> Result<Option<Vec<u8>>, SyncError> {
    match tokio::fs::read(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn send_operation(ctx: &ClientContext, op: FileOperation) -> Result<(), SyncError> {
    let conn = ctx.connection.read().await.clone();
    let Some(conn) = conn else {
        debug!(path = %op.path, op = %op.op, "Not connected, dropping local change");
        return Ok(());
    };
    debug!(path = %op.path, op = %op.op, is_dir = op.is_dir, "Sending local change");
    conn.send(&op.into()).await
}
