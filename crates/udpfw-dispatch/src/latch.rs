use tokio::sync::watch;

/// One-shot signal observable by any number of tasks.
///
/// Wraps a `watch` channel so that waiters registered after the trip
/// still return immediately.
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub fn new() -> Latch {
        let (tx, _) = watch::channel(false);
        Latch { tx }
    }

    /// Trip the latch. Returns true on the first call only.
    pub fn trip(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the latch has been tripped.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`; wait_for cannot fail here.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Latch {
    fn default() -> Latch {
        Latch::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Latch;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn trip_reports_first_call_only() {
        let latch = Latch::new();
        assert!(!latch.is_set());
        assert!(latch.trip());
        assert!(!latch.trip());
        assert!(latch.is_set());
    }

    #[tokio::test]
    async fn wait_resolves_for_late_and_early_waiters() {
        let latch = Arc::new(Latch::new());

        let early = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.trip();

        tokio::time::timeout(Duration::from_secs(1), early)
            .await
            .expect("early waiter woke")
            .unwrap();
        // Late waiter returns immediately.
        tokio::time::timeout(Duration::from_secs(1), latch.wait())
            .await
            .expect("late waiter woke");
    }
}
