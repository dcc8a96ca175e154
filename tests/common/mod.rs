//! Shared helpers for the end-to-end server tests: a scripted sudo client
//! speaking the framed protocol over TCP, a scripted upstream log server,
//! and test configuration plumbing.

use std::convert::TryInto;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time;

use sudo_logsrvd::config::{Config, EventLogType, ListenAddress};
use sudo_logsrvd::protocol::{ClientMessage, ServerMessage, TimeSpec};
use sudo_logsrvd::server::Server;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Reserve a local address for the server under test.
pub async fn free_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A config pointing all persistent state into `root`, with a short ack
/// frequency so commit points arrive quickly.
pub fn test_config(addr: SocketAddr, root: &Path) -> Config {
    let mut config = Config::default();
    config.server.listen_address = vec![ListenAddress { addr, tls: false }];
    config.server.timeout = Duration::from_secs(5);
    config.server.ack_frequency = Duration::from_millis(100);
    config.server.shutdown_timeout = Duration::from_secs(5);
    config.server.max_message_size = 64 * 1024;
    config.server.pid_file = None;
    config.iolog.iolog_dir = root.join("io");
    config.eventlog.log_type = EventLogType::Json;
    config.eventlog.log_file = root.join("sudo.log");
    config
}

/// Run the server in the background; the returned sender shuts it down.
pub fn start_server(
    config: Config,
) -> (
    tokio::task::JoinHandle<Result<(), anyhow::Error>>,
    oneshot::Sender<()>,
) {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(
        Server::new(config, "/nonexistent/sudo_logsrvd.conf", 0.0).run(async {
            let _ = shutdown_rx.await;
        }),
    );
    (handle, shutdown_tx)
}

/// A scripted sudo client: framed messages over plain TCP.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    /// Connect, retrying briefly while the server is still binding.
    pub async fn connect(addr: SocketAddr) -> TestClient {
        let deadline = time::Instant::now() + Duration::from_secs(2);
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    return TestClient {
                        stream,
                        buf: BytesMut::new(),
                    }
                }
                Err(_) if time::Instant::now() < deadline => {
                    time::sleep(Duration::from_millis(20)).await;
                }
                Err(err) => panic!("unable to connect to test server: {}", err),
            }
        }
    }

    pub async fn send(&mut self, msg: &ClientMessage) {
        let payload = msg.encode().unwrap();
        self.send_raw(&(payload.len() as u32).to_be_bytes()).await;
        self.send_raw(&payload).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// The next server message, or `None` once the server closes.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            if self.buf.len() >= 4 {
                let len = u32::from_be_bytes(self.buf[..4].try_into().unwrap()) as usize;
                if self.buf.len() >= 4 + len {
                    self.buf.advance(4);
                    let payload = self.buf.split_to(len);
                    return Some(ServerMessage::decode(&payload).expect("invalid server message"));
                }
            }
            let mut chunk = [0u8; 4096];
            let n = time::timeout(RECV_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for the server")
                .expect("read error");
            if n == 0 {
                assert!(self.buf.is_empty(), "connection closed mid-frame");
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read the mandatory ServerHello that opens every connection.
    pub async fn expect_hello(&mut self) {
        match self.recv().await {
            Some(ServerMessage::Hello(hello)) => {
                assert!(
                    hello.server_id.starts_with("Sudo Audit Server"),
                    "unexpected server id: {}",
                    hello.server_id
                );
            }
            other => panic!("expected ServerHello, got {:?}", other),
        }
    }
}

/// A scripted upstream log server for relay tests: accepts one connection,
/// sends a hello, collects every frame payload, and acknowledges an Exit
/// with a generous final commit point.
pub async fn run_upstream(listener: TcpListener) -> Vec<Vec<u8>> {
    let (mut stream, _) = listener.accept().await.unwrap();

    async fn send(stream: &mut TcpStream, msg: &ServerMessage) {
        let payload = msg.encode().unwrap();
        stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&payload).await.unwrap();
    }

    send(
        &mut stream,
        &ServerMessage::Hello(sudo_logsrvd::protocol::ServerHello::new(
            "Sudo Audit Server test-upstream",
        )),
    )
    .await;

    let mut payloads = Vec::new();
    let mut buf = BytesMut::new();
    'outer: loop {
        while buf.len() >= 4 {
            let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
            if buf.len() < 4 + len {
                break;
            }
            buf.advance(4);
            let payload = buf.split_to(len).to_vec();
            let is_exit = matches!(
                ClientMessage::decode(&payload),
                Ok(ClientMessage::Exit(_))
            );
            payloads.push(payload);
            if is_exit {
                send(&mut stream, &ServerMessage::CommitPoint(TimeSpec::new(9999, 0))).await;
                break 'outer;
            }
        }
        let mut chunk = [0u8; 4096];
        let n = time::timeout(RECV_TIMEOUT, stream.read(&mut chunk))
            .await
            .expect("timed out waiting for relayed frames")
            .expect("upstream read error");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    payloads
}
