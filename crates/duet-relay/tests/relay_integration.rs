#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the relay server.
//!
//! Each test binds a relay on an ephemeral port and drives it with real TCP
//! clients speaking the line protocol.

use std::net::SocketAddr;
use std::time::Duration;

use duet_core::config::RelayConfig;
use duet_core::protocol::ServerMessage;
use duet_relay::RelayServer;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Relay {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Relay {
    async fn start() -> Self {
        Self::start_with(RelayConfig::default()).await
    }

    async fn start_with(mut config: RelayConfig) -> Self {
        config.bind_addr = "127.0.0.1:0".into();
        let server = RelayServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            server.run(token).await.unwrap();
        });
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .unwrap()
            .unwrap();
    }
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn login(addr: SocketAddr, name: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(&format!("LOGIN:{name}")).await;
        assert_eq!(client.recv_skipping_presence().await, "LOGIN_SUCCESS");
        client
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Next line, or `None` on EOF.
    async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for relay")
            .unwrap_or(None)
    }

    async fn recv_skipping_presence(&mut self) -> String {
        loop {
            let line = self.recv().await.expect("connection closed");
            if !line.starts_with("USERS:") {
                return line;
            }
        }
    }

    /// Wait until a presence push lists exactly `expected`.
    async fn wait_for_presence(&mut self, expected: &[&str]) {
        loop {
            let line = self.recv().await.expect("connection closed");
            if let Ok(ServerMessage::Users(users)) = ServerMessage::parse(&line) {
                if users == expected {
                    return;
                }
            }
        }
    }
}

#[tokio::test]
async fn login_pushes_presence_to_everyone() {
    let relay = Relay::start().await;
    let mut alice = TestClient::login(relay.addr, "alice").await;
    alice.wait_for_presence(&["alice"]).await;

    let mut bob = TestClient::login(relay.addr, "bob").await;
    bob.wait_for_presence(&["alice", "bob"]).await;
    alice.wait_for_presence(&["alice", "bob"]).await;
    relay.stop().await;
}

#[tokio::test]
async fn duplicate_username_is_rejected_and_closed() {
    let relay = Relay::start().await;
    let _alice = TestClient::login(relay.addr, "alice").await;

    let mut imposter = TestClient::connect(relay.addr).await;
    imposter.send("LOGIN:alice").await;
    let reply = imposter.recv().await.unwrap();
    assert!(reply.starts_with("ERROR:"), "got {reply}");
    assert!(reply.contains("already taken"));
    assert_eq!(imposter.recv().await, None);
    relay.stop().await;
}

#[tokio::test]
async fn simultaneous_logins_have_one_winner() {
    let relay = Relay::start().await;
    let mut first = TestClient::connect(relay.addr).await;
    let mut second = TestClient::connect(relay.addr).await;
    tokio::join!(first.send("LOGIN:alice"), second.send("LOGIN:alice"));

    let (a, b) = tokio::join!(first.recv_skipping_presence(), second.recv_skipping_presence());
    let successes = [&a, &b].iter().filter(|l| l.as_str() == "LOGIN_SUCCESS").count();
    let errors = [&a, &b].iter().filter(|l| l.starts_with("ERROR:")).count();
    assert_eq!((successes, errors), (1, 1), "got {a:?} and {b:?}");
    relay.stop().await;
}

#[tokio::test]
async fn private_message_reaches_only_receiver() {
    let relay = Relay::start().await;
    let mut alice = TestClient::login(relay.addr, "alice").await;
    let mut bob = TestClient::login(relay.addr, "bob").await;
    let mut carol = TestClient::login(relay.addr, "carol").await;

    alice.send("PRIVATE:bob:meet at 10\\:30").await;
    let line = bob.recv_skipping_presence().await;
    match ServerMessage::parse(&line).unwrap() {
        ServerMessage::Private {
            sender,
            receiver,
            content,
            ..
        } => {
            assert_eq!(sender, "alice");
            assert_eq!(receiver, "bob");
            assert_eq!(content, "meet at 10:30");
        }
        other => panic!("unexpected {other:?}"),
    }

    // Carol only ever sees presence; a heartbeat round-trip proves nothing else is queued.
    carol.send("HEARTBEAT").await;
    assert_eq!(carol.recv_skipping_presence().await, "HEARTBEAT_ACK");
    relay.stop().await;
}

#[tokio::test]
async fn broadcast_excludes_sender() {
    let relay = Relay::start().await;
    let mut alice = TestClient::login(relay.addr, "alice").await;
    let mut bob = TestClient::login(relay.addr, "bob").await;

    alice.send("MSG:hello everyone").await;
    let line = bob.recv_skipping_presence().await;
    assert!(matches!(
        ServerMessage::parse(&line).unwrap(),
        ServerMessage::Broadcast { ref sender, ref content, .. }
            if sender == "alice" && content == "hello everyone"
    ));

    alice.send("HEARTBEAT").await;
    assert_eq!(alice.recv_skipping_presence().await, "HEARTBEAT_ACK");
    relay.stop().await;
}

#[tokio::test]
async fn private_to_offline_user_is_rejected() {
    let relay = Relay::start().await;
    let mut alice = TestClient::login(relay.addr, "alice").await;
    alice.send("PRIVATE:ghost:boo").await;
    assert_eq!(
        alice.recv_skipping_presence().await,
        "ERROR:user ghost is offline"
    );
    relay.stop().await;
}

#[tokio::test]
async fn get_users_excludes_requester() {
    let relay = Relay::start().await;
    let mut alice = TestClient::login(relay.addr, "alice").await;
    let _bob = TestClient::login(relay.addr, "bob").await;
    alice.wait_for_presence(&["alice", "bob"]).await;

    alice.send("GET_USERS").await;
    alice.wait_for_presence(&["bob"]).await;
    relay.stop().await;
}

#[tokio::test]
async fn unknown_and_premature_commands() {
    let relay = Relay::start().await;
    let mut anon = TestClient::connect(relay.addr).await;
    anon.send("GET_USERS").await;
    assert_eq!(anon.recv().await.unwrap(), "ERROR:login required");
    assert_eq!(anon.recv().await, None);

    let mut alice = TestClient::login(relay.addr, "alice").await;
    alice.send("DANCE:now").await;
    assert_eq!(alice.recv_skipping_presence().await, "ERROR:unknown command");
    alice.send("LOGIN:alice").await;
    assert_eq!(alice.recv_skipping_presence().await, "ERROR:already logged in");
    relay.stop().await;
}

#[tokio::test]
async fn logout_removes_user_from_presence() {
    let relay = Relay::start().await;
    let mut alice = TestClient::login(relay.addr, "alice").await;
    let mut bob = TestClient::login(relay.addr, "bob").await;
    alice.wait_for_presence(&["alice", "bob"]).await;

    bob.send("LOGOUT:alice").await;
    assert!(bob.recv_skipping_presence().await.starts_with("ERROR:"));

    bob.send("LOGOUT:bob").await;
    loop {
        if bob.recv().await.is_none() {
            break;
        }
    }
    alice.wait_for_presence(&["alice"]).await;

    // The name is free again.
    let _bob_again = TestClient::login(relay.addr, "bob").await;
    relay.stop().await;
}

#[tokio::test]
async fn silent_client_is_evicted() {
    let relay = Relay::start_with(RelayConfig {
        heartbeat_check_interval_secs: 1,
        heartbeat_timeout_secs: 1,
        ..RelayConfig::default()
    })
    .await;
    let mut watcher = TestClient::login(relay.addr, "watcher").await;
    let mut silent = TestClient::login(relay.addr, "silent").await;
    watcher.wait_for_presence(&["silent", "watcher"]).await;

    // Keep the watcher alive while the other client says nothing.
    let keepalive = tokio::spawn(async move {
        for _ in 0..8 {
            watcher.send("HEARTBEAT").await;
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        watcher
    });

    loop {
        if silent.recv().await.is_none() {
            break;
        }
    }

    let mut watcher = keepalive.await.unwrap();
    watcher.wait_for_presence(&["watcher"]).await;
    relay.stop().await;
}

#[tokio::test]
async fn login_must_arrive_in_time() {
    let relay = Relay::start_with(RelayConfig {
        login_timeout_secs: 1,
        ..RelayConfig::default()
    })
    .await;
    let mut lazy = TestClient::connect(relay.addr).await;
    assert_eq!(lazy.recv().await.unwrap(), "ERROR:login timeout");
    assert_eq!(lazy.recv().await, None);
    relay.stop().await;
}

#[tokio::test]
async fn shutdown_notifies_clients() {
    let relay = Relay::start().await;
    let mut alice = TestClient::login(relay.addr, "alice").await;
    relay.shutdown.cancel();

    assert_eq!(
        alice.recv_skipping_presence().await,
        "ERROR:server shutting down"
    );
    tokio::time::timeout(Duration::from_secs(10), relay.handle)
        .await
        .unwrap()
        .unwrap();
}
