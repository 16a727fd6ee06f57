//! Resilient client side of a dispatch session.
//!
//! The client holds at most one live [`DispatchConnection`] and owns
//! the reconnection state machine around it. Its read and write
//! service tasks each hold one of a pair of suspend gates across every
//! connection operation; `reboot` holds both gates across the whole
//! reconnect, so the tasks only ever observe the current connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use udpfw_proto::{Frame, FrameKind};

use crate::latch::Latch;

mod connection;

pub use connection::DispatchConnection;

/// Outbound payloads waiting for the writer. Senders block when full.
const SEND_QUEUE_DEPTH: usize = 4096;

/// Inbound payloads waiting for the packet consumer.
const PACKET_QUEUE_DEPTH: usize = 4096;

/// Pause between failed connection attempts.
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(2);

/// Upper bound on the best-effort goodbye to a session being torn
/// down; a wedged peer must not stall the teardown.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DispatchClientError {
    #[error("cannot write: drain in progress")]
    Draining,
    #[error("connection is broken, try again")]
    ConnectionBroken,
    #[error("server did not respond to handshake in time")]
    HandshakeTimeout,
    #[error("server responded with invalid ack")]
    HandshakeRejected,
    #[error("protocol error: {0}")]
    Proto(#[from] udpfw_proto::ProtoError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    Switching,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Switching => "switching",
            Status::Disconnecting => "disconnecting",
            Status::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// The most recent connection failure, with its timestamp.
#[derive(Debug, Clone)]
pub struct LastError {
    pub message: String,
    pub at: SystemTime,
}

/// Handle to a running dispatch client. Cheap to clone.
#[derive(Clone)]
pub struct DispatchClient {
    core: Arc<ClientCore>,
}

impl DispatchClient {
    /// Build a client for `address`, subscribing to `namespace`.
    /// Returns the client and the stream of payloads relayed by peers.
    pub fn new(address: String, namespace: String) -> (DispatchClient, mpsc::Receiver<Bytes>) {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_DEPTH);

        let core = Arc::new(ClientCore {
            address,
            namespace,
            status: Mutex::new(Status::Disconnected),
            last_error: Mutex::new(None),
            server_host: Mutex::new(None),
            draining: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            conn: Mutex::new(None),
            send_tx: Mutex::new(Some(send_tx)),
            send_rx: tokio::sync::Mutex::new(Some(send_rx)),
            writer_done: Latch::new(),
            packet_tx: Mutex::new(Some(packet_tx)),
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
            read_gate: Arc::new(tokio::sync::Mutex::new(())),
            gate_guards: Mutex::new(None),
            suspended: AtomicBool::new(false),
        });

        (DispatchClient { core }, packet_rx)
    }

    /// Connect (retrying forever) and service the session until
    /// shutdown. Returns once the client is fully disconnected.
    pub async fn run(&self) {
        self.core.make_connection().await;
        if !self.core.stop_flag() {
            let mut writes = tokio::spawn(ClientCore::service_writes(Arc::clone(&self.core)));
            let mut reads = tokio::spawn(ClientCore::service_reads(Arc::clone(&self.core)));
            tokio::select! {
                _ = &mut writes => {}
                _ = &mut reads => {}
            }
        }
        self.core.set_status(Status::Disconnected);
    }

    /// Queue a payload for relay. Fails fast while draining; otherwise
    /// only awaits queue admission.
    pub async fn send(&self, payload: Bytes) -> Result<(), DispatchClientError> {
        if self.core.draining.load(Ordering::SeqCst) {
            return Err(DispatchClientError::Draining);
        }
        let tx = {
            let guard = self.core.send_tx.lock().expect("send queue lock");
            guard.clone()
        };
        match tx {
            Some(tx) => tx
                .send(payload)
                .await
                .map_err(|_| DispatchClientError::Draining),
            None => Err(DispatchClientError::Draining),
        }
    }

    pub fn status(&self) -> Status {
        *self.core.status.lock().expect("status lock")
    }

    /// Hostname reported by the server during the last handshake.
    pub fn server_host(&self) -> Option<Bytes> {
        self.core.server_host.lock().expect("server host lock").clone()
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.core.last_error.lock().expect("last error lock").clone()
    }

    /// Drain outbound traffic, say goodbye and tear the session down.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}

pub(crate) struct ClientCore {
    address: String,
    namespace: String,

    status: Mutex<Status>,
    last_error: Mutex<Option<LastError>>,
    server_host: Mutex<Option<Bytes>>,
    draining: AtomicBool,
    stop: AtomicBool,

    conn: Mutex<Option<Arc<DispatchConnection>>>,

    send_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    send_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,
    writer_done: Latch,
    packet_tx: Mutex<Option<mpsc::Sender<Bytes>>>,

    write_gate: Arc<tokio::sync::Mutex<()>>,
    read_gate: Arc<tokio::sync::Mutex<()>>,
    gate_guards: Mutex<Option<(OwnedMutexGuard<()>, OwnedMutexGuard<()>)>>,
    suspended: AtomicBool,
}

impl ClientCore {
    fn stop_flag(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: Status) {
        *self.status.lock().expect("status lock") = status;
        debug!(%status, "status transitioned");
    }

    fn record_error(&self, error: &DispatchClientError) {
        *self.last_error.lock().expect("last error lock") = Some(LastError {
            message: error.to_string(),
            at: SystemTime::now(),
        });
    }

    fn current_conn(&self) -> Option<Arc<DispatchConnection>> {
        self.conn.lock().expect("conn lock").clone()
    }

    /// Take a suspend gate and observe the current connection under
    /// it. The caller keeps the returned guard until its read or write
    /// on that connection has completed, so `reboot` cannot swap the
    /// session underneath an operation in flight.
    async fn gated_conn(
        &self,
        gate: &Arc<tokio::sync::Mutex<()>>,
    ) -> (OwnedMutexGuard<()>, Option<Arc<DispatchConnection>>) {
        let guard = Arc::clone(gate).lock_owned().await;
        (guard, self.current_conn())
    }

    /// Dial until a session handshakes, sleeping between attempts.
    /// Returns early only when shutdown is in progress.
    async fn make_connection(self: &Arc<Self>) {
        self.set_status(Status::Connecting);
        loop {
            if self.stop_flag() {
                return;
            }
            match DispatchConnection::open(&self.address, &self.namespace, Arc::downgrade(self))
                .await
            {
                Ok(conn) => {
                    let host = conn.server_host();
                    *self.server_host.lock().expect("server host lock") = Some(host.clone());
                    *self.conn.lock().expect("conn lock") = Some(conn);
                    info!(host = %String::from_utf8_lossy(&host), "now connected");
                    if self.suspended.load(Ordering::SeqCst) {
                        self.resume();
                    }
                    self.set_status(Status::Connected);
                    return;
                }
                Err(e) => {
                    error!(error = %e, cooldown = ?RECONNECT_COOLDOWN, "connection attempt failed");
                    self.record_error(&e);
                    tokio::time::sleep(RECONNECT_COOLDOWN).await;
                }
            }
        }
    }

    /// Writer service task: relays queued payloads as PKT frames.
    /// A payload survives reconnects; it is retried until a write
    /// succeeds, so delivery is at-least-once across sessions.
    async fn service_writes(self: Arc<Self>) {
        let mut rx = self
            .send_rx
            .lock()
            .await
            .take()
            .expect("writer started more than once");

        'queue: while let Some(payload) = rx.recv().await {
            loop {
                let (gate, conn) = self.gated_conn(&self.write_gate).await;
                let Some(conn) = conn else {
                    drop(gate);
                    if self.stop_flag() {
                        break 'queue;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                };
                let result = conn.write_frame(FrameKind::Pkt, &payload).await;
                drop(gate);
                match result {
                    Ok(()) => break,
                    Err(_) if self.stop_flag() => break 'queue,
                    Err(_) => {
                        debug!(
                            "failed writing current packet due to broken link, \
                             will retry after resynchronization"
                        );
                        // The reconnect runs on its own task; let it in.
                        tokio::task::yield_now().await;
                    }
                }
            }
        }

        self.writer_done.trip();
    }

    /// Reader service task: dispatches frames from the current session.
    async fn service_reads(self: Arc<Self>) {
        while !self.stop_flag() {
            let (gate, conn) = self.gated_conn(&self.read_gate).await;
            let Some(conn) = conn else {
                drop(gate);
                if self.stop_flag() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };
            let frame = conn.next_frame().await;
            // Released before dispatch: a BYE reboots, and reboot takes
            // both gates.
            drop(gate);
            let Some(frame) = frame else {
                // Session ended; the broken-link path suspends the gates
                // while it reconnects.
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            };
            self.handle_frame(frame).await;
        }
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame.kind() {
            FrameKind::Pkt => {
                let tx = {
                    let guard = self.packet_tx.lock().expect("packet sink lock");
                    guard.clone()
                };
                if let Some(tx) = tx {
                    let _ = tx.send(frame.into_payload()).await;
                }
            }
            FrameKind::Bye => {
                info!("received disconnection request from dispatcher, reconnecting...");
                self.reboot().await;
            }
            other => {
                warn!(kind = ?other, "received unexpected frame from dispatcher");
            }
        }
    }

    /// Lock both gates, as owned guards parked on the core, so the
    /// service tasks block at their next gate transit.
    async fn suspend(&self) {
        debug!("suspending reads and writes");
        let write_guard = Arc::clone(&self.write_gate).lock_owned().await;
        let read_guard = Arc::clone(&self.read_gate).lock_owned().await;
        *self.gate_guards.lock().expect("gate guard lock") = Some((write_guard, read_guard));
        self.suspended.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        debug!("resuming reads and writes");
        self.suspended.store(false, Ordering::SeqCst);
        *self.gate_guards.lock().expect("gate guard lock") = None;
    }

    /// Replace the current session: suspend both gates, close the old
    /// connection with a best-effort BYE, reconnect, resume.
    async fn reboot(self: &Arc<Self>) {
        debug!("now switching dispatch server");
        self.set_status(Status::Switching);
        self.suspend().await;

        if let Some(conn) = self.current_conn() {
            let goodbye = tokio::time::timeout(GOODBYE_TIMEOUT, conn.write_frame(FrameKind::Bye, b""));
            if !matches!(goodbye.await, Ok(Ok(()))) {
                debug!("failed emitting BYE frame on the old session");
            }
            conn.shutdown().await;
        }

        self.make_connection().await;

        if self.stop_flag() && self.suspended.load(Ordering::SeqCst) {
            // Shutdown raced the reconnect; the service tasks still need
            // the gates released to observe the stop flag.
            self.resume();
        }
    }

    /// Broken-link notification from a connection. The reconnect runs
    /// on its own task: the notifier may be holding a suspend gate and
    /// `reboot` has to take both. Stale notifications from an
    /// already-replaced session are dropped.
    pub(crate) fn notify_broken(self: &Arc<Self>, conn: &Arc<DispatchConnection>) {
        let core = Arc::clone(self);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            {
                let current = core.conn.lock().expect("conn lock");
                let is_current = current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &conn));
                if !is_current || core.suspended.load(Ordering::SeqCst) {
                    return;
                }
            }
            info!("received broken connection notification, will attempt to reconnect");
            core.reboot().await;
        });
    }

    async fn drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("drain started");
        drop(self.send_tx.lock().expect("send queue lock").take());
        let writer_started = self.send_rx.lock().await.is_none();
        if writer_started {
            self.writer_done.wait().await;
        }
        info!("drain completed");
    }

    pub(crate) async fn shutdown(self: &Arc<Self>) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown called");
        self.set_status(Status::Disconnecting);

        self.drain().await;

        if let Some(conn) = self.current_conn() {
            let goodbye = tokio::time::timeout(GOODBYE_TIMEOUT, conn.write_frame(FrameKind::Bye, b""));
            if !matches!(goodbye.await, Ok(Ok(()))) {
                error!("failed emitting BYE frame");
            }
            conn.shutdown().await;
        }

        // Closes the packet stream once in-flight deliveries finish.
        *self.packet_tx.lock().expect("packet sink lock") = None;
    }
}
