//! Capture/injection seam.
//!
//! The heavy machinery for sniffing a NIC and writing raw frames stays
//! outside this crate; the agent only needs something that yields
//! captured datagrams and accepts datagrams to put back on the wire.
//! [`UdpMulticastIo`] is the stock implementation: one socket joined to
//! a multicast group serves both directions.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Largest datagram the capture path will hand out.
const MAX_DATAGRAM: usize = 64 * 1024;

#[async_trait]
pub trait PacketSource: Send + Sync {
    /// Next captured datagram; `None` once the source is closed.
    async fn next_packet(&self) -> Option<Bytes>;
}

#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Put a relayed datagram back on the local network.
    async fn inject(&self, pkt: Bytes) -> io::Result<()>;
}

/// Multicast group membership over a single UDP socket.
pub struct UdpMulticastIo {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
}

impl UdpMulticastIo {
    /// Bind the group port and join `group` on `interface`.
    pub async fn bind(
        group: Ipv4Addr,
        port: u16,
        interface: Ipv4Addr,
    ) -> io::Result<UdpMulticastIo> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.join_multicast_v4(group, interface)?;
        // Our own injections must not come straight back as captures.
        socket.set_multicast_loop_v4(false)?;

        info!(%group, port, "joined multicast group");
        Ok(UdpMulticastIo {
            socket: Arc::new(socket),
            group: SocketAddr::V4(SocketAddrV4::new(group, port)),
        })
    }
}

#[async_trait]
impl PacketSource for UdpMulticastIo {
    async fn next_packet(&self) -> Option<Bytes> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                debug!(size = n, %from, "captured datagram");
                buf.truncate(n);
                Some(Bytes::from(buf))
            }
            Err(_) => None,
        }
    }
}

#[async_trait]
impl PacketSink for UdpMulticastIo {
    async fn inject(&self, pkt: Bytes) -> io::Result<()> {
        self.socket.send_to(&pkt, self.group).await?;
        debug!(size = pkt.len(), "injected datagram");
        Ok(())
    }
}
