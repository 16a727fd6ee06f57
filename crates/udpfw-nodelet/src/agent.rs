//! Pump loops tying capture, dispatch and injection together.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::client::{DispatchClient, DispatchClientError};
use crate::loopguard::LoopGuard;
use crate::packetio::{PacketSink, PacketSource};

/// Capture -> dispatch. Every captured frame is registered with the
/// loop guard before it leaves, so its echo can be recognized later.
pub fn spawn_emitter(
    source: Arc<dyn PacketSource>,
    client: DispatchClient,
    guard: Arc<LoopGuard>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(pkt) = source.next_packet().await {
            guard.register(&pkt);
            match client.send(pkt).await {
                Ok(()) => {}
                Err(DispatchClientError::Draining) => {
                    info!("dispatch is draining, stopping capture pump");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "failed enqueueing captured packet");
                }
            }
        }
        info!("packet source closed, stopping capture pump");
    })
}

/// Dispatch -> injection. Frames that the loop guard recognizes as
/// fresh local captures are echoes and get dropped.
pub fn spawn_injector(
    mut packets: mpsc::Receiver<Bytes>,
    sink: Arc<dyn PacketSink>,
    guard: Arc<LoopGuard>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(pkt) = packets.recv().await {
            if guard.should_drop(&pkt) {
                debug!("dropped packet blocked by loop guard");
                continue;
            }
            if let Err(e) = sink.inject(pkt).await {
                error!(error = %e, "failed injecting packet");
            }
        }
        info!("packet stream closed, stopping injection pump");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct QueueSource {
        packets: tokio::sync::Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl PacketSource for QueueSource {
        async fn next_packet(&self) -> Option<Bytes> {
            self.packets.lock().await.pop()
        }
    }

    struct RecordingSink {
        injected: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn inject(&self, pkt: Bytes) -> std::io::Result<()> {
            self.injected.lock().expect("sink lock").push(pkt);
            Ok(())
        }
    }

    #[tokio::test]
    async fn injector_drops_fresh_echoes_and_passes_foreign_packets() {
        let guard = Arc::new(LoopGuard::new());
        let sink = Arc::new(RecordingSink {
            injected: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel(16);

        let pump = spawn_injector(rx, Arc::clone(&sink) as Arc<dyn PacketSink>, Arc::clone(&guard));

        guard.register(b"local echo");
        tx.send(Bytes::from_static(b"local echo")).await.unwrap();
        tx.send(Bytes::from_static(b"from a peer")).await.unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .expect("pump stopped")
            .unwrap();

        let injected = sink.injected.lock().expect("sink lock");
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].as_ref(), b"from a peer");
    }

    #[tokio::test]
    async fn emitter_registers_captures_with_the_guard() {
        let guard = Arc::new(LoopGuard::new());
        let source = Arc::new(QueueSource {
            packets: tokio::sync::Mutex::new(vec![Bytes::from_static(b"captured")]),
        });
        let (client, _packets) = DispatchClient::new("127.0.0.1:1".into(), "ns".into());

        let pump = spawn_emitter(source, client, Arc::clone(&guard));
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .expect("pump stopped")
            .unwrap();

        assert!(guard.should_drop(b"captured"));
    }
}
