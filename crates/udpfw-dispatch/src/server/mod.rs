//! Broker server: accept loop, bus ingress, graceful drain.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use udpfw_proto::{encode, Envelope, Frame, FrameKind};

use crate::bus::{Bus, BusError};
use crate::ident::IdGenerator;
use crate::latch::Latch;

pub mod clients;
pub mod connection;
pub mod namespaces;

pub use clients::ClientMap;
pub use connection::Connection;
pub use namespaces::NamespaceIndex;

pub struct Server {
    hostname: String,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    namespaces: NamespaceIndex,
    clients: ClientMap,
    ids: IdGenerator,
    bus: Arc<dyn Bus>,
    stopping: Latch,
    drained: Notify,
}

impl Server {
    /// Bind the listener and assemble an idle server. Call [`Server::run`]
    /// to start serving.
    pub async fn bind(
        addr: SocketAddr,
        hostname: String,
        bus: Arc<dyn Bus>,
    ) -> anyhow::Result<Arc<Server>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Arc::new(Server {
            hostname,
            local_addr,
            listener: Mutex::new(Some(listener)),
            namespaces: NamespaceIndex::new(),
            clients: ClientMap::new(),
            ids: IdGenerator::new(),
            bus,
            stopping: Latch::new(),
            drained: Notify::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn connected_count(&self) -> usize {
        self.clients.len()
    }

    /// Serve until the listener fails or [`Server::shutdown`] runs.
    pub async fn run(self: &Arc<Server>) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .expect("server listener lock")
            .take()
            .expect("run called more than once");

        let ingress = Arc::clone(self);
        tokio::spawn(async move { ingress.service_bus().await });

        self.accept_loop(listener).await
    }

    async fn accept_loop(self: &Arc<Server>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = self.stopping.wait() => return Ok(()),
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    if self.stopping.is_set() {
                        return Ok(());
                    }
                    error!(error = %e, "failed accepting client");
                    return Err(e.into());
                }
            };

            let id = self.ids.next();
            let conn = Arc::new(Connection::new(id.clone()));
            self.clients.insert(id.clone(), Arc::clone(&conn));
            debug!(client = %id, addr = %peer, "registered new client");

            let server = Arc::clone(self);
            tokio::spawn(async move {
                conn.serve(stream, &server).await;
                server.unregister(&conn);
            });
        }
    }

    /// Pull envelopes off the bus and fan them out locally.
    async fn service_bus(&self) {
        loop {
            match self.bus.next().await {
                Ok(blob) => self.fan_out(blob).await,
                Err(BusError::Closed) => {
                    info!("bus closed, will stop iterating packets");
                    return;
                }
                Err(e) => {
                    // A misbehaving backend must not spin this task.
                    error!(error = %e, "bus read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn fan_out(&self, blob: Bytes) {
        let env = match Envelope::parse(blob) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "discarding malformed envelope");
                return;
            }
        };

        let members = self.namespaces.snapshot(env.namespace());
        if members.is_empty() {
            return;
        }

        let frame = env.clone().into_payload();
        for conn in members {
            if conn.id() == env.source() {
                continue;
            }
            conn.write(frame.clone()).await;
        }
    }

    /// Publish a client's PKT frame to every peer in its namespace.
    ///
    /// Best-effort: publish failures are logged, never propagated to the
    /// producing connection.
    pub(crate) async fn broadcast(&self, from: &Connection, frame: &Frame) {
        let Some(namespace) = from.namespace() else {
            return;
        };

        let wire = match encode(FrameKind::Pkt, frame.payload()) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(client = from.id(), error = %e, "dropping unencodable frame");
                return;
            }
        };
        if wire.len() > u16::MAX as usize {
            warn!(client = from.id(), size = wire.len(), "frame too large for envelope");
            return;
        }

        let blob = udpfw_proto::envelope::make_envelope(from.id(), namespace, &wire);
        if let Err(e) = self.bus.publish(blob).await {
            error!(client = from.id(), error = %e, "CRITICAL: failed emitting broadcast");
        }
    }

    pub(crate) fn register_namespace(&self, conn: Arc<Connection>) {
        let Some(namespace) = conn.namespace().map(str::to_string) else {
            return;
        };
        self.namespaces.add(&namespace, conn);
    }

    /// Membership snapshot for one namespace; exposed for tests.
    pub fn namespace_members(&self, namespace: &str) -> Vec<Arc<Connection>> {
        self.namespaces.snapshot(namespace)
    }

    fn unregister(&self, conn: &Arc<Connection>) {
        if let Some(namespace) = conn.namespace() {
            self.namespaces.delete(namespace, conn);
        }
        self.clients.remove(conn.id());
        self.drained.notify_waiters();
        debug!(client = conn.id(), "deregistered client");
    }

    /// Stop accepting, ask every client to leave, wait for them to do
    /// so, then close the bus. Idempotent.
    pub async fn shutdown(&self) {
        if !self.stopping.trip() {
            return;
        }

        info!("stopping listener...");
        info!("dispatching shutdown frame to clients");
        let bye = encode(FrameKind::Bye, b"").expect("empty frame");
        for conn in self.clients.snapshot() {
            conn.write(bye.clone()).await;
            debug!(client = conn.id(), "dispatched shutdown");
        }

        info!("waiting for clients to drain...");
        let mut tick = tokio::time::interval(Duration::from_secs(3));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // the first tick completes immediately

        while !self.clients.is_empty() {
            tokio::select! {
                _ = self.drained.notified() => {}
                _ = tick.tick() => {
                    info!(clients_left = self.clients.len(), "still waiting for clients to drain");
                }
            }
        }

        if let Err(e) = self.bus.shutdown().await {
            error!(error = %e, "CRITICAL: bus shutdown failed");
        }
        info!("drain complete");
    }
}
