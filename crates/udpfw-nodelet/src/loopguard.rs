//! Echo suppression for relayed multicast frames.
//!
//! A frame captured locally and relayed through dispatch usually comes
//! back through the peer's injector; without this cache it would be
//! re-injected and re-captured in a storm. Every captured frame is
//! registered by digest, and inbound frames with a still-fresh digest
//! are dropped. The window tolerates round-trip jitter; the periodic
//! sweep bounds memory without per-entry timers.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::latch::Latch;

/// How long a registered digest keeps matching.
pub const ECHO_TTL: Duration = Duration::from_secs(2);

/// How often expired digests are swept out.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct Entries {
    map: HashMap<u64, Instant>,
    // The hasher state lives under the same lock as the map.
    hasher: ahash::RandomState,
}

impl Entries {
    fn digest(&self, pkt: &[u8]) -> u64 {
        self.hasher.hash_one(pkt)
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map
            .retain(|_, at| now.saturating_duration_since(*at) <= ECHO_TTL);
        before - self.map.len()
    }
}

pub struct LoopGuard {
    entries: Arc<Mutex<Entries>>,
    stop: Arc<Latch>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LoopGuard {
    pub fn new() -> LoopGuard {
        LoopGuard {
            entries: Arc::new(Mutex::new(Entries {
                map: HashMap::new(),
                hasher: ahash::RandomState::new(),
            })),
            stop: Arc::new(Latch::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the background sweeper. Call once.
    pub fn start(&self) {
        let entries = Arc::clone(&self.entries);
        let stop = Arc::clone(&self.stop);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = stop.wait() => return,
                    _ = tick.tick() => {}
                }
                let swept = entries.lock().expect("loop guard lock").sweep(Instant::now());
                if swept > 0 {
                    debug!(swept, "swept expired packet digests");
                }
            }
        });
        *self.sweeper.lock().expect("loop guard sweeper lock") = Some(handle);
    }

    pub fn stop(&self) {
        self.stop.trip();
    }

    /// Record a locally captured frame.
    pub fn register(&self, pkt: &[u8]) {
        self.register_at(pkt, Instant::now());
    }

    /// True when this frame was captured locally within the TTL window.
    pub fn should_drop(&self, pkt: &[u8]) -> bool {
        self.should_drop_at(pkt, Instant::now())
    }

    fn register_at(&self, pkt: &[u8], now: Instant) {
        let mut guard = self.entries.lock().expect("loop guard lock");
        let digest = guard.digest(pkt);
        guard.map.insert(digest, now);
    }

    fn should_drop_at(&self, pkt: &[u8], now: Instant) -> bool {
        let guard = self.entries.lock().expect("loop guard lock");
        let digest = guard.digest(pkt);
        guard
            .map
            .get(&digest)
            .is_some_and(|at| now.saturating_duration_since(*at) < ECHO_TTL)
    }

    #[cfg(test)]
    fn sweep_at(&self, now: Instant) -> usize {
        self.entries.lock().expect("loop guard lock").sweep(now)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("loop guard lock").map.len()
    }
}

impl Default for LoopGuard {
    fn default() -> LoopGuard {
        LoopGuard::new()
    }
}
