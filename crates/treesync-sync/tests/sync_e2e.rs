//! End-to-end tests over loopback WebSockets
//!
//! Each test starts a real server on an ephemeral port. Some tests drive it
//! with raw protocol peers to observe exact message order, others run full
//! clients against it and wait for the trees to converge.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use treesync_core::config::ServerConfig;
use treesync_core::protocol::{Envelope, FileContentMessage, FileOperation, FileRequestMessage};
use treesync_core::{Manifest, PathIgnorer};
use treesync_sync::client::{Client, ClientOptions};
use treesync_sync::server::{ConnectionRegistry, Server};
use treesync_sync::SyncError;

type Peer = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Test helpers
// ============================================================================

struct RunningServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), SyncError>>,
}

impl RunningServer {
    async fn start(dir: &Path, ignore: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(DashMap::new());
        let config = ServerConfig {
            directory: dir.to_path_buf(),
            ..ServerConfig::default()
        };
        let server = Server::with_registry(config, PathIgnorer::parse(ignore), Arc::clone(&registry));

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { server.serve(listener, token).await });

        Self {
            addr,
            registry,
            cancel,
            handle,
        }
    }

    fn endpoint(&self) -> String {
        format!("ws://{}/sync", self.addr)
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("server shut down in time")
            .unwrap()
            .unwrap();
    }
}

fn start_client(
    endpoint: String,
    dir: &Path,
    cancel: &CancellationToken,
) -> JoinHandle<Result<(), SyncError>> {
    let options = ClientOptions {
        endpoint,
        directory: dir.to_path_buf(),
        delete: true,
        dry_run: false,
        reconnect_backoff: Duration::from_millis(200),
        echo_grace: Duration::from_secs(2),
    };
    let client = Client::new(options, PathIgnorer::default());
    let token = cancel.clone();
    tokio::spawn(async move { client.run(token).await })
}

/// Connects a raw protocol peer and consumes the manifest the server sends first.
async fn connect_peer(server: &RunningServer) -> (Peer, Manifest) {
    let (mut ws, _) = connect_async(server.endpoint()).await.unwrap();
    match next_envelope(&mut ws).await {
        Envelope::Manifest(m) => (ws, m.files),
        other => panic!("expected manifest first, got {other:?}"),
    }
}

async fn next_envelope(ws: &mut Peer) -> Envelope {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Envelope::decode(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("envelope arrived in time")
}

async fn send(ws: &mut Peer, envelope: Envelope) {
    ws.send(Message::Text(envelope.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn send_raw(ws: &mut Peer, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Polls `condition` until it holds or the wait budget runs out.
async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn read(path: impl AsRef<Path>) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}

// ============================================================================
// Protocol-level tests
// ============================================================================

#[tokio::test]
async fn test_manifest_is_sent_on_connect() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("a.txt"), b"A").unwrap();
    std::fs::write(dir.path().join("sub/b.txt"), b"B").unwrap();
    let server = RunningServer::start(dir.path(), "").await;

    let (_peer, manifest) = connect_peer(&server).await;

    assert_eq!(manifest.paths().collect::<Vec<_>>(), vec!["a.txt", "sub/b.txt"]);
    server.stop().await;
}

#[tokio::test]
async fn test_file_request_answered_in_order() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"A").unwrap();
    std::fs::write(dir.path().join("b.txt"), b"B").unwrap();
    let server = RunningServer::start(dir.path(), "").await;
    let (mut peer, _) = connect_peer(&server).await;

    send(
        &mut peer,
        Envelope::FileRequest(FileRequestMessage {
            paths: vec!["b.txt".into(), "missing.txt".into(), "a.txt".into()],
        }),
    )
    .await;

    assert_eq!(
        next_envelope(&mut peer).await,
        Envelope::FileContent(FileContentMessage {
            path: "b.txt".into(),
            content: b"B".to_vec()
        })
    );
    assert_eq!(
        next_envelope(&mut peer).await,
        Envelope::FileContent(FileContentMessage {
            path: "a.txt".into(),
            content: b"A".to_vec()
        })
    );
    server.stop().await;
}

#[tokio::test]
async fn test_operations_applied_and_relayed_in_order() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(dir.path(), "").await;
    let (mut sender, _) = connect_peer(&server).await;
    let (mut observer, _) = connect_peer(&server).await;
    wait_until("both peers registered", || server.registry.len() == 2).await;

    let o1 = FileOperation::write("same.txt", b"first".to_vec());
    let o2 = FileOperation::write("same.txt", b"second".to_vec());
    send(&mut sender, o1.clone().into()).await;
    send(&mut sender, o2.clone().into()).await;

    assert_eq!(next_envelope(&mut observer).await, Envelope::from(o1));
    assert_eq!(next_envelope(&mut observer).await, Envelope::from(o2));
    assert_eq!(read(dir.path().join("same.txt")).unwrap(), b"second");
    server.stop().await;
}

#[tokio::test]
async fn test_ignored_operation_is_dropped() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(dir.path(), "*.tmp").await;
    let (mut sender, _) = connect_peer(&server).await;
    let (mut observer, _) = connect_peer(&server).await;
    wait_until("both peers registered", || server.registry.len() == 2).await;

    send(&mut sender, FileOperation::write("scratch.tmp", b"x".to_vec()).into()).await;
    let kept = FileOperation::write("kept.txt", b"k".to_vec());
    send(&mut sender, kept.clone().into()).await;

    // The queue is FIFO, so a relayed scratch.tmp would have arrived first
    assert_eq!(next_envelope(&mut observer).await, Envelope::from(kept));
    assert!(!dir.path().join("scratch.tmp").exists());
    server.stop().await;
}

#[tokio::test]
async fn test_bad_messages_do_not_end_the_connection() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"A").unwrap();
    let server = RunningServer::start(dir.path(), "").await;
    let (mut peer, _) = connect_peer(&server).await;

    send_raw(&mut peer, r#"{"type":"ping","payload":{}}"#).await;
    send_raw(&mut peer, "not json at all").await;
    send(
        &mut peer,
        Envelope::FileRequest(FileRequestMessage {
            paths: vec!["a.txt".into()],
        }),
    )
    .await;

    assert!(matches!(
        next_envelope(&mut peer).await,
        Envelope::FileContent(c) if c.path == "a.txt"
    ));
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_endpoint_is_rejected() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(dir.path(), "").await;

    let result = connect_async(format!("ws://{}/elsewhere", server.addr)).await;
    assert!(result.is_err());
    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_unregisters_peer() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(dir.path(), "").await;
    let (peer, _) = connect_peer(&server).await;
    wait_until("peer registered", || server.registry.len() == 1).await;

    drop(peer);
    wait_until("peer unregistered", || server.registry.is_empty()).await;
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_with_peer_stuck_in_handshake() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(dir.path(), "").await;

    // Plain TCP, never upgraded to a WebSocket
    let _silent = TcpStream::connect(server.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.cancel.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(2), server.handle)
        .await
        .expect("server stopped promptly");
    stopped.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_with_connected_peer() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(dir.path(), "").await;
    let (_peer, _) = connect_peer(&server).await;
    wait_until("peer registered", || server.registry.len() == 1).await;

    server.cancel.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(2), server.handle)
        .await
        .expect("server stopped promptly");
    stopped.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_file_request_does_not_follow_symlinks() {
    let outer = TempDir::new().unwrap();
    let root = outer.path().join("root");
    let secret = outer.path().join("secret");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::create_dir_all(&secret).unwrap();
    std::fs::write(secret.join("key"), b"TOPSECRET").unwrap();
    std::fs::write(root.join("plain.txt"), b"P").unwrap();
    std::os::unix::fs::symlink(&secret, root.join("link")).unwrap();
    let server = RunningServer::start(&root, "").await;
    let (mut peer, manifest) = connect_peer(&server).await;
    assert_eq!(manifest.paths().collect::<Vec<_>>(), vec!["plain.txt"]);

    send(
        &mut peer,
        Envelope::FileRequest(FileRequestMessage {
            paths: vec!["link/key".into(), "plain.txt".into()],
        }),
    )
    .await;
    assert_eq!(
        next_envelope(&mut peer).await,
        Envelope::FileContent(FileContentMessage {
            path: "plain.txt".into(),
            content: b"P".to_vec()
        })
    );

    // Writes through the link are refused and never relayed
    let (mut observer, _) = connect_peer(&server).await;
    wait_until("both peers registered", || server.registry.len() == 2).await;
    send(&mut peer, FileOperation::write("link/planted", b"x".to_vec()).into()).await;
    let marker = FileOperation::write("after.txt", b"a".to_vec());
    send(&mut peer, marker.clone().into()).await;

    assert_eq!(next_envelope(&mut observer).await, Envelope::from(marker));
    assert!(!secret.join("planted").exists());
    server.stop().await;
}

// ============================================================================
// Full client tests
// ============================================================================

#[tokio::test]
async fn test_client_converges_to_server_tree() {
    let server_dir = TempDir::new().unwrap();
    std::fs::create_dir_all(server_dir.path().join("sub")).unwrap();
    std::fs::write(server_dir.path().join("a.txt"), b"A").unwrap();
    std::fs::write(server_dir.path().join("b.txt"), b"B").unwrap();
    std::fs::write(server_dir.path().join("sub/d.txt"), b"D").unwrap();

    let client_dir = TempDir::new().unwrap();
    std::fs::write(client_dir.path().join("a.txt"), b"A").unwrap();
    std::fs::write(client_dir.path().join("c.txt"), b"C").unwrap();

    let server = RunningServer::start(server_dir.path(), "").await;
    let cancel = CancellationToken::new();
    let client = start_client(server.endpoint(), client_dir.path(), &cancel);

    let root = client_dir.path();
    wait_until("client tree to match server", || {
        read(root.join("b.txt")).as_deref() == Some(b"B".as_slice())
            && read(root.join("sub/d.txt")).as_deref() == Some(b"D".as_slice())
            && !root.join("c.txt").exists()
    })
    .await;
    assert_eq!(read(root.join("a.txt")).unwrap(), b"A");
    // The server's tree is untouched by the client's extras
    assert!(!server_dir.path().join("c.txt").exists());

    cancel.cancel();
    client.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_local_change_reaches_other_client() {
    let server_dir = TempDir::new().unwrap();
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let server = RunningServer::start(server_dir.path(), "").await;
    let cancel = CancellationToken::new();
    let client_a = start_client(server.endpoint(), dir_a.path(), &cancel);
    let client_b = start_client(server.endpoint(), dir_b.path(), &cancel);
    wait_until("both clients connected", || server.registry.len() == 2).await;

    std::fs::create_dir_all(dir_a.path().join("notes")).unwrap();
    std::fs::write(dir_a.path().join("notes/today.md"), b"hello").unwrap();

    let in_b = dir_b.path().join("notes/today.md");
    let in_server = server_dir.path().join("notes/today.md");
    wait_until("write to reach the other client", || {
        read(&in_b).as_deref() == Some(b"hello".as_slice())
            && read(&in_server).as_deref() == Some(b"hello".as_slice())
    })
    .await;

    std::fs::remove_file(dir_a.path().join("notes/today.md")).unwrap();
    wait_until("removal to reach the other client", || {
        !in_b.exists() && !in_server.exists()
    })
    .await;

    cancel.cancel();
    client_a.await.unwrap().unwrap();
    client_b.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_client_reconnects_after_server_restart() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();

    // Reserve a port, then release it so the client first fails to connect
    let addr = {
        let reserve = TcpListener::bind("127.0.0.1:0").await.unwrap();
        reserve.local_addr().unwrap()
    };
    let cancel = CancellationToken::new();
    let client = start_client(format!("ws://{addr}/sync"), client_dir.path(), &cancel);
    tokio::time::sleep(Duration::from_millis(300)).await;

    std::fs::write(server_dir.path().join("late.txt"), b"L").unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let config = ServerConfig {
        directory: server_dir.path().to_path_buf(),
        ..ServerConfig::default()
    };
    let server = Server::new(config, PathIgnorer::default());
    let server_cancel = CancellationToken::new();
    let token = server_cancel.clone();
    let server_task = tokio::spawn(async move { server.serve(listener, token).await });

    let target = client_dir.path().join("late.txt");
    wait_until("client to sync after reconnecting", || {
        read(&target).as_deref() == Some(b"L".as_slice())
    })
    .await;

    cancel.cancel();
    client.await.unwrap().unwrap();
    server_cancel.cancel();
    server_task.await.unwrap().unwrap();
}
