//! End-to-end tests for the dispatch client against a mock broker:
//! - HELLO/ACK handshake and server host reporting
//! - payload relay in both directions
//! - reconnect across a killed socket and across a server BYE
//! - drain semantics on shutdown

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use udpfw_nodelet::client::{DispatchClient, DispatchClientError, Status};
use udpfw_proto::{encode, Assembler, Frame, FrameKind};

const MOCK_HOST: &[u8] = b"mock-dispatch";

/// Broker stand-in accepting one session at a time.
struct MockDispatch {
    listener: TcpListener,
}

struct MockSession {
    stream: TcpStream,
    assembler: Assembler,
    pending: VecDeque<Frame>,
}

impl MockDispatch {
    async fn start() -> (MockDispatch, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (MockDispatch { listener }, addr)
    }

    /// Accept a connection and complete the HELLO/ACK handshake.
    /// Returns the session and the namespace the client asked for.
    async fn accept_session(&self) -> anyhow::Result<(MockSession, String)> {
        let mut session = self.accept_raw().await?;
        let hello = session.recv_frame(Duration::from_secs(2)).await?;
        anyhow::ensure!(hello.kind() == FrameKind::Hello, "expected HELLO first");
        let namespace = String::from_utf8_lossy(hello.payload()).into_owned();
        session.send_frame(FrameKind::Ack, MOCK_HOST).await?;
        Ok((session, namespace))
    }

    /// Accept without acknowledging anything.
    async fn accept_raw(&self) -> anyhow::Result<MockSession> {
        let (stream, _) = timeout(Duration::from_secs(10), self.listener.accept()).await??;
        Ok(MockSession {
            stream,
            assembler: Assembler::new(),
            pending: VecDeque::new(),
        })
    }
}

impl MockSession {
    async fn send_frame(&mut self, kind: FrameKind, payload: &[u8]) -> anyhow::Result<()> {
        let wire = encode(kind, payload)?;
        self.stream.write_all(&wire).await?;
        Ok(())
    }

    async fn recv_frame(&mut self, wait: Duration) -> anyhow::Result<Frame> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                anyhow::bail!("timed out waiting for a frame");
            }
            let mut buf = vec![0u8; 4096];
            let n = timeout(deadline - now, self.stream.read(&mut buf)).await??;
            if n == 0 {
                anyhow::bail!("client closed the connection");
            }
            for &b in &buf[..n] {
                if let Some(frame) = self.assembler.feed(b) {
                    self.pending.push_back(frame);
                }
            }
        }
    }
}

fn spawn_client(addr: SocketAddr, namespace: &str) -> (DispatchClient, tokio::sync::mpsc::Receiver<Bytes>) {
    let (client, packets) = DispatchClient::new(addr.to_string(), namespace.to_string());
    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });
    (client, packets)
}

async fn await_status(client: &DispatchClient, want: Status, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    while client.status() != want {
        assert!(
            tokio::time::Instant::now() < deadline,
            "status never became {want}, still {}",
            client.status()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn handshake_reports_connected_and_server_host() -> anyhow::Result<()> {
    let (server, addr) = MockDispatch::start().await;
    let (client, _packets) = spawn_client(addr, "ns1");

    let (_session, namespace) = server.accept_session().await?;
    assert_eq!(namespace, "ns1");

    await_status(&client, Status::Connected, Duration::from_secs(2)).await;
    assert_eq!(client.server_host().unwrap().as_ref(), MOCK_HOST);
    Ok(())
}

#[tokio::test]
async fn send_relays_payload_as_pkt_frame() -> anyhow::Result<()> {
    let (server, addr) = MockDispatch::start().await;
    let (client, _packets) = spawn_client(addr, "ns1");
    let (mut session, _) = server.accept_session().await?;
    await_status(&client, Status::Connected, Duration::from_secs(2)).await;

    client.send(Bytes::from_static(b"captured frame")).await?;

    let frame = session.recv_frame(Duration::from_secs(2)).await?;
    assert_eq!(frame.kind(), FrameKind::Pkt);
    assert_eq!(frame.payload(), b"captured frame");
    Ok(())
}

#[tokio::test]
async fn inbound_pkt_lands_on_the_packet_stream() -> anyhow::Result<()> {
    let (server, addr) = MockDispatch::start().await;
    let (client, mut packets) = spawn_client(addr, "ns1");
    let (mut session, _) = server.accept_session().await?;
    await_status(&client, Status::Connected, Duration::from_secs(2)).await;

    session.send_frame(FrameKind::Pkt, b"from a peer").await?;

    let payload = timeout(Duration::from_secs(2), packets.recv())
        .await?
        .expect("packet stream open");
    assert_eq!(payload.as_ref(), b"from a peer");
    Ok(())
}

#[tokio::test]
async fn reconnects_after_socket_kill_and_delivers_next_payload() -> anyhow::Result<()> {
    let (server, addr) = MockDispatch::start().await;
    let (client, _packets) = spawn_client(addr, "ns1");
    let (mut session1, _) = server.accept_session().await?;
    await_status(&client, Status::Connected, Duration::from_secs(2)).await;

    client.send(Bytes::from_static(b"P1")).await?;
    let frame = session1.recv_frame(Duration::from_secs(2)).await?;
    assert_eq!(frame.payload(), b"P1");

    // Kill the link under the client.
    drop(session1);

    // The next send must not surface an error; the payload rides the
    // fresh session once the reconnect handshake completes.
    client.send(Bytes::from_static(b"P2")).await?;

    let (mut session2, namespace) = server.accept_session().await?;
    assert_eq!(namespace, "ns1");
    let frame = session2.recv_frame(Duration::from_secs(5)).await?;
    assert_eq!(frame.kind(), FrameKind::Pkt);
    assert_eq!(frame.payload(), b"P2");

    await_status(&client, Status::Connected, Duration::from_secs(2)).await;
    Ok(())
}

#[tokio::test]
async fn server_bye_triggers_a_reconnect() -> anyhow::Result<()> {
    let (server, addr) = MockDispatch::start().await;
    let (client, _packets) = spawn_client(addr, "ns1");
    let (mut session1, _) = server.accept_session().await?;
    await_status(&client, Status::Connected, Duration::from_secs(2)).await;

    session1.send_frame(FrameKind::Bye, b"").await?;

    // The client says goodbye to the old session (best effort) and
    // dials again.
    let (_session2, namespace) = server.accept_session().await?;
    assert_eq!(namespace, "ns1");
    await_status(&client, Status::Connected, Duration::from_secs(2)).await;
    Ok(())
}

#[tokio::test]
async fn rejected_handshake_is_retried_after_cooldown() -> anyhow::Result<()> {
    let (server, addr) = MockDispatch::start().await;
    let (client, _packets) = spawn_client(addr, "ns1");

    // First session replies with garbage instead of ACK.
    {
        let mut bad = server.accept_raw().await?;
        let hello = bad.recv_frame(Duration::from_secs(2)).await?;
        assert_eq!(hello.kind(), FrameKind::Hello);
        bad.send_frame(FrameKind::Pkt, b"nope").await?;
    }

    // After the cooldown the client dials again; this time it works.
    let (_session, _) = server.accept_session().await?;
    await_status(&client, Status::Connected, Duration::from_secs(5)).await;
    assert!(client.last_error().is_some());
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_says_bye_and_closes_the_packet_stream() -> anyhow::Result<()> {
    let (server, addr) = MockDispatch::start().await;
    let (client, mut packets) = spawn_client(addr, "ns1");
    let (mut session, _) = server.accept_session().await?;
    await_status(&client, Status::Connected, Duration::from_secs(2)).await;

    client.send(Bytes::from_static(b"last words")).await?;
    timeout(Duration::from_secs(5), client.shutdown()).await?;

    // The queued payload flushed before the goodbye.
    let frame = session.recv_frame(Duration::from_secs(2)).await?;
    assert_eq!(frame.kind(), FrameKind::Pkt);
    assert_eq!(frame.payload(), b"last words");
    let frame = session.recv_frame(Duration::from_secs(2)).await?;
    assert_eq!(frame.kind(), FrameKind::Bye);

    // Sends fail fast now, and the packet stream ends.
    assert!(matches!(
        client.send(Bytes::from_static(b"too late")).await,
        Err(DispatchClientError::Draining)
    ));
    let leftover = timeout(Duration::from_secs(2), packets.recv()).await?;
    assert!(leftover.is_none());

    await_status(&client, Status::Disconnected, Duration::from_secs(2)).await;
    Ok(())
}
