//! One TCP session with a dispatch broker.
//!
//! The connection owns a background read task feeding the shared
//! assembler; completed frames land on a bounded channel consumed by
//! the client. Write failures mark the session broken exactly once and
//! notify the owning client, unless the close was deliberate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use udpfw_proto::{encode, Assembler, Frame, FrameKind};

use crate::client::{ClientCore, DispatchClientError};
use crate::latch::Latch;

/// Completed frames buffered between the read task and the client.
const FRAME_QUEUE_DEPTH: usize = 100;

/// How long the server gets to acknowledge the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct DispatchConnection {
    write: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    frames: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    running: AtomicBool,
    disconnecting: AtomicBool,
    broken: AtomicBool,
    closed: Latch,
    parent: Mutex<Option<Weak<ClientCore>>>,
    server_host: OnceLock<Bytes>,
}

impl DispatchConnection {
    /// Dial, handshake and return a live session. The socket is closed
    /// again if the handshake fails.
    pub(crate) async fn open(
        address: &str,
        namespace: &str,
        parent: Weak<ClientCore>,
    ) -> Result<Arc<DispatchConnection>, DispatchClientError> {
        let stream = TcpStream::connect(address).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let conn = Arc::new(DispatchConnection {
            write: tokio::sync::Mutex::new(Some(write_half)),
            frames: tokio::sync::Mutex::new(frame_rx),
            running: AtomicBool::new(true),
            disconnecting: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            closed: Latch::new(),
            parent: Mutex::new(Some(parent)),
            server_host: OnceLock::new(),
        });

        {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.service_reads(read_half, frame_tx).await });
        }

        if let Err(e) = conn.handshake(namespace).await {
            conn.shutdown().await;
            return Err(e);
        }

        Ok(conn)
    }

    async fn handshake(self: &Arc<Self>, namespace: &str) -> Result<(), DispatchClientError> {
        self.write_frame(FrameKind::Hello, namespace.as_bytes())
            .await?;

        let first = match timeout(HANDSHAKE_TIMEOUT, self.next_frame()).await {
            Err(_) => return Err(DispatchClientError::HandshakeTimeout),
            Ok(None) => return Err(DispatchClientError::HandshakeRejected),
            Ok(Some(frame)) => frame,
        };

        if first.kind() != FrameKind::Ack {
            return Err(DispatchClientError::HandshakeRejected);
        }
        let _ = self.server_host.set(first.into_payload());
        Ok(())
    }

    /// Hostname the server reported in its handshake reply. Opaque
    /// bytes, surfaced verbatim.
    pub fn server_host(&self) -> Bytes {
        self.server_host.get().cloned().unwrap_or_default()
    }

    /// Next completed frame; `None` once the session is closed.
    pub(crate) async fn next_frame(&self) -> Option<Frame> {
        self.frames.lock().await.recv().await
    }

    /// Write one frame fully. A failed write marks the session broken
    /// and hands the owning client a break notification before the
    /// error returns.
    pub(crate) async fn write_frame(
        self: &Arc<Self>,
        kind: FrameKind,
        payload: &[u8],
    ) -> Result<(), DispatchClientError> {
        let wire = encode(kind, payload)?;

        let failed = {
            let mut guard = self.write.lock().await;
            let Some(write) = guard.as_mut() else {
                return Err(DispatchClientError::ConnectionBroken);
            };
            // The latch keeps a stalled peer from pinning this write
            // past a deliberate close.
            tokio::select! {
                result = write.write_all(&wire) => result.is_err(),
                _ = self.closed.wait() => true,
            }
        };
        if failed {
            self.flag_broken();
            return Err(DispatchClientError::ConnectionBroken);
        }
        Ok(())
    }

    /// Deliberately close the session. Break notifications can no
    /// longer reach the parent after this.
    pub(crate) async fn shutdown(&self) {
        self.disconnecting.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        *self.parent.lock().expect("connection parent lock") = None;
        // The read task exits on the latch and drops its socket half.
        self.closed.trip();
        if let Some(mut write) = self.write.lock().await.take() {
            let _ = write.shutdown().await;
        }
    }

    async fn service_reads(self: Arc<Self>, mut read: OwnedReadHalf, frames: mpsc::Sender<Frame>) {
        let mut assembler = Assembler::new();
        let mut buf = BytesMut::with_capacity(4096);

        while self.running.load(Ordering::SeqCst) {
            buf.clear();
            let n = tokio::select! {
                result = read.read_buf(&mut buf) => match result {
                    Ok(0) | Err(_) => {
                        self.flag_broken();
                        break;
                    }
                    Ok(n) => n,
                },
                _ = self.closed.wait() => break,
            };

            for i in 0..n {
                if let Some(frame) = assembler.feed(buf[i]) {
                    if frames.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Deliver the broken-link notification, at most once per session
    /// and never during a deliberate shutdown.
    fn flag_broken(self: &Arc<Self>) {
        if self.disconnecting.load(Ordering::SeqCst) {
            return;
        }
        if self.broken.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("dispatch link broke");

        // Frees a writer blocked on a wedged socket and stops the read
        // task; either one may be holding a suspend gate that the
        // reconnect needs.
        self.closed.trip();

        let parent = {
            let guard = self.parent.lock().expect("connection parent lock");
            guard.clone().and_then(|weak| weak.upgrade())
        };
        if let Some(parent) = parent {
            parent.notify_broken(self);
        }
    }
}
