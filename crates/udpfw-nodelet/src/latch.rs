use tokio::sync::watch;

/// One-shot signal observable by any number of tasks.
pub(crate) struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub(crate) fn new() -> Latch {
        let (tx, _) = watch::channel(false);
        Latch { tx }
    }

    /// Trip the latch. Returns true on the first call only.
    pub(crate) fn trip(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the latch has been tripped.
    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|set| *set).await;
    }
}
