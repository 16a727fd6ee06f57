//! One TCP peer on the broker side.
//!
//! A connection runs two cooperating tasks: a reader that feeds the
//! frame assembler and a writer that drains a bounded queue of
//! pre-encoded frames. Either task halting halts the other; the server
//! deregisters the connection once both have exited.

use std::sync::{Arc, Mutex, OnceLock};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use udpfw_proto::constants::GLOBAL_NAMESPACE;
use udpfw_proto::{encode, Assembler, Frame, FrameKind};

use crate::latch::Latch;
use crate::server::Server;

/// Depth of the per-connection write queue. Producers block when full.
const WRITE_QUEUE_DEPTH: usize = 64;

pub struct Connection {
    id: String,
    namespace: OnceLock<String>,
    write_tx: mpsc::Sender<Bytes>,
    write_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    ready: Latch,
    stopped: Latch,
}

impl Connection {
    pub fn new(id: String) -> Connection {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        Connection {
            id,
            namespace: OnceLock::new(),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            ready: Latch::new(),
            stopped: Latch::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Namespace bound by the handshake; `None` until HELLO completes.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.get().map(String::as_str)
    }

    /// Enqueue an encoded frame. Awaits while the queue is full; a
    /// stopped connection discards the frame.
    pub async fn write(&self, frame: Bytes) {
        let _ = self.write_tx.send(frame).await;
    }

    /// Idempotently stop both service tasks. Returns true the first time.
    pub fn drop_peer(&self) -> bool {
        self.stopped.trip()
    }

    /// Service the socket until both tasks exit.
    pub async fn serve(self: &Arc<Self>, stream: TcpStream, server: &Server) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let write_rx = self
            .write_rx
            .lock()
            .expect("connection queue lock")
            .take()
            .expect("serve called more than once");

        tokio::join!(
            self.service_reads(read_half, server),
            self.service_writes(write_half, write_rx),
        );
    }

    async fn service_reads(self: &Arc<Self>, mut read: OwnedReadHalf, server: &Server) {
        let mut assembler = Assembler::new();
        let mut buf = BytesMut::with_capacity(4096);
        let mut awaiting_hello = true;

        'outer: loop {
            buf.clear();
            let n = tokio::select! {
                result = read.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        if self.drop_peer() {
                            debug!(client = %self.id, "client disconnected without BYE frame");
                        }
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        if self.drop_peer() {
                            error!(client = %self.id, error = %e, "error reading");
                        }
                        break;
                    }
                },
                _ = self.stopped.wait() => break,
            };

            for i in 0..n {
                let frame = assembler.feed(buf[i]);

                if awaiting_hello
                    && assembler.buffered() >= 3
                    && assembler.expected_kind() != FrameKind::Hello
                {
                    warn!(client = %self.id, "dropping client offering invalid handshake");
                    self.drop_peer();
                    break 'outer;
                }

                let Some(frame) = frame else { continue };

                if awaiting_hello {
                    if frame.kind() != FrameKind::Hello {
                        warn!(client = %self.id, kind = ?frame.kind(), "dropping client offering invalid handshake");
                        self.drop_peer();
                        break 'outer;
                    }
                    self.complete_handshake(&frame, server).await;
                    awaiting_hello = false;
                    continue;
                }

                self.handle_frame(frame, server).await;

                if self.stopped.is_set() {
                    break 'outer;
                }
            }
        }
    }

    async fn complete_handshake(self: &Arc<Self>, hello: &Frame, server: &Server) {
        let namespace = if hello.payload().is_empty() {
            GLOBAL_NAMESPACE.to_string()
        } else {
            String::from_utf8_lossy(hello.payload()).into_owned()
        };
        info!(client = %self.id, namespace = %namespace, "received valid handshake");

        let _ = self.namespace.set(namespace);
        server.register_namespace(Arc::clone(self));

        let ack = encode(FrameKind::Ack, server.hostname().as_bytes())
            .expect("hostname fits a frame payload");
        self.write(ack).await;
        self.ready.trip();
    }

    async fn handle_frame(&self, frame: Frame, server: &Server) {
        match frame.kind() {
            FrameKind::Hello => {
                debug!(client = %self.id, "ignoring repeated HELLO");
            }
            FrameKind::Ping => {
                let pong = encode(FrameKind::Pong, b"").expect("empty frame");
                self.write(pong).await;
            }
            FrameKind::Pkt => {
                debug!(client = %self.id, size = frame.payload().len(), "processing PKT frame");
                server.broadcast(self, &frame).await;
            }
            FrameKind::Bye => {
                debug!(client = %self.id, "processing BYE frame");
                self.drop_peer();
            }
            FrameKind::Invalid => {
                warn!(client = %self.id, tag = frame.raw_tag(), "ignoring frame with invalid kind");
            }
            FrameKind::Ack | FrameKind::Pong => {
                debug!(client = %self.id, kind = ?frame.kind(), "ignoring unexpected frame");
            }
        }
    }

    async fn service_writes(&self, mut write: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
        // Nothing goes out before the handshake is acknowledged.
        tokio::select! {
            _ = self.ready.wait() => {}
            _ = self.stopped.wait() => return,
        }

        loop {
            let frame = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = self.stopped.wait() => break,
            };

            if let Err(e) = write.write_all(&frame).await {
                if self.drop_peer() {
                    error!(client = %self.id, error = %e, "error writing");
                }
                break;
            }
            debug!(client = %self.id, size = frame.len(), "wrote frame to client");
        }

        let _ = write.shutdown().await;
    }
}
