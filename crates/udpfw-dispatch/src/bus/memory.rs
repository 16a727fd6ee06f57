use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Bus, BusError};

const SEND_QUEUE_DEPTH: usize = 256;
const DELIVERY_QUEUE_DEPTH: usize = 1024;

/// Process-local bus: published blobs loop straight back to the local
/// subscription, through the same bounded send queue and writer task a
/// remote backend would use.
pub struct MemoryBus {
    channel: String,
    running: AtomicBool,
    send_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    deliver_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBus {
    pub fn new(channel: impl Into<String>) -> MemoryBus {
        MemoryBus {
            channel: channel.into(),
            running: AtomicBool::new(false),
            send_tx: Mutex::new(None),
            deliver_rx: tokio::sync::Mutex::new(None),
            writer: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn start(&self) -> Result<(), BusError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadyRunning);
        }

        info!(name = %self.channel, "subscribing to channel");

        let (send_tx, mut send_rx) = mpsc::channel::<Bytes>(SEND_QUEUE_DEPTH);
        let (deliver_tx, deliver_rx) = mpsc::channel::<Bytes>(DELIVERY_QUEUE_DEPTH);

        // The writer is the only holder of the delivery sender, so its
        // exit is what ends the subscription stream for consumers.
        let writer = tokio::spawn(async move {
            while let Some(data) = send_rx.recv().await {
                if deliver_tx.send(data).await.is_err() {
                    break;
                }
            }
            debug!("send queue drained, stop servicing writes");
        });

        *self.send_tx.lock().expect("bus send lock") = Some(send_tx);
        *self.deliver_rx.lock().await = Some(deliver_rx);
        *self.writer.lock().expect("bus writer lock") = Some(writer);
        Ok(())
    }

    async fn publish(&self, data: Bytes) -> Result<(), BusError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BusError::NotRunning);
        }
        let tx = {
            let guard = self.send_tx.lock().expect("bus send lock");
            guard.clone()
        };
        match tx {
            Some(tx) => tx.send(data).await.map_err(|_| BusError::Closed),
            None => Err(BusError::NotRunning),
        }
    }

    async fn next(&self) -> Result<Bytes, BusError> {
        // Accepted publishes still sitting in the subscription are
        // delivered even while shutdown runs; the stream only reports
        // closed once it is empty and the writer is gone.
        let mut guard = self.deliver_rx.lock().await;
        let rx = guard.as_mut().ok_or(BusError::Closed)?;
        rx.recv().await.ok_or(BusError::Closed)
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(name = %self.channel, "bus shutdown called");

        // Closing the send queue lets the writer observe the end of
        // input and flush everything publish() already accepted.
        drop(self.send_tx.lock().expect("bus send lock").take());
        let writer = self.writer.lock().expect("bus writer lock").take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        // Only now close the subscription. A consumer mid-drain holds
        // the lock until it sees the end of the stream.
        drop(self.deliver_rx.lock().await.take());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_loops_back_to_subscription() {
        let bus = MemoryBus::new("test-exchange");
        bus.start().await.unwrap();

        bus.publish(Bytes::from_static(b"one")).await.unwrap();
        bus.publish(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(bus.next().await.unwrap().as_ref(), b"one");
        assert_eq!(bus.next().await.unwrap().as_ref(), b"two");
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let bus = MemoryBus::new("test-exchange");
        bus.start().await.unwrap();
        assert!(matches!(bus.start().await, Err(BusError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn publish_before_start_is_rejected() {
        let bus = MemoryBus::new("test-exchange");
        assert!(matches!(
            bus.publish(Bytes::from_static(b"x")).await,
            Err(BusError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn next_after_shutdown_reports_closed() {
        let bus = MemoryBus::new("test-exchange");
        bus.start().await.unwrap();
        bus.shutdown().await.unwrap();
        assert!(matches!(bus.next().await, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiting_consumer() {
        let bus = std::sync::Arc::new(MemoryBus::new("test-exchange"));
        bus.start().await.unwrap();

        let consumer = {
            let bus = std::sync::Arc::clone(&bus);
            tokio::spawn(async move { bus.next().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.shutdown().await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), consumer)
            .await
            .expect("consumer woke")
            .unwrap();
        assert!(matches!(result, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn backlog_published_before_shutdown_is_still_delivered() {
        let bus = std::sync::Arc::new(MemoryBus::new("test-exchange"));
        bus.start().await.unwrap();

        // Park the consumer inside next() first, so it is mid-drain
        // when shutdown runs.
        let consumer = {
            let bus = std::sync::Arc::clone(&bus);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(blob) = bus.next().await {
                    seen.push(blob);
                }
                seen
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        bus.publish(Bytes::from_static(b"one")).await.unwrap();
        bus.publish(Bytes::from_static(b"two")).await.unwrap();
        bus.publish(Bytes::from_static(b"three")).await.unwrap();
        bus.shutdown().await.unwrap();

        let seen = tokio::time::timeout(std::time::Duration::from_secs(1), consumer)
            .await
            .expect("consumer finished")
            .unwrap();
        let seen: Vec<&[u8]> = seen.iter().map(|b| b.as_ref()).collect();
        assert_eq!(seen, vec![&b"one"[..], b"two", b"three"]);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let bus = MemoryBus::new("test-exchange");
        bus.start().await.unwrap();
        bus.shutdown().await.unwrap();
        bus.shutdown().await.unwrap();
    }
}
