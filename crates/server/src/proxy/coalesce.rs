//! In-process fill coalescing.
//!
//! The first request for a key becomes the leader and performs the fill;
//! requests arriving while it runs subscribe to its outcome instead of
//! attempting the distributed lock themselves.

use crate::error::ErrorKind;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use stowage_core::CacheState;
use tokio::sync::broadcast;

/// What the leader reports to waiting followers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FillSignal {
    /// The cache now answers for the key with this state.
    Settled(CacheState),
    /// The leader could not cache and served its caller directly.
    PassedThrough,
    Failed { kind: ErrorKind, message: String },
}

pub(crate) enum Slot {
    Leader(LeaderGuard),
    Follower(broadcast::Receiver<FillSignal>),
}

#[derive(Clone, Default)]
pub(crate) struct FillCoalescer {
    inflight: Arc<DashMap<String, broadcast::Sender<FillSignal>>>,
}

impl FillCoalescer {
    pub(crate) fn join(&self, key: &str) -> Slot {
        if let Some(existing) = self.inflight.get(key) {
            return Slot::Follower(existing.subscribe());
        }

        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => Slot::Follower(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                // One signal per fill; followers only ever read the first.
                let (sender, _) = broadcast::channel(1);
                entry.insert(sender.clone());
                Slot::Leader(LeaderGuard {
                    inflight: Arc::clone(&self.inflight),
                    key: key.to_string(),
                    sender,
                })
            }
        }
    }

    pub(crate) fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

/// Leadership of one fill. Dropping it without [`LeaderGuard::finish`]
/// (for example when the leader's future is cancelled) closes the channel,
/// and followers retry on their own.
pub(crate) struct LeaderGuard {
    inflight: Arc<DashMap<String, broadcast::Sender<FillSignal>>>,
    key: String,
    sender: broadcast::Sender<FillSignal>,
}

impl LeaderGuard {
    pub(crate) fn finish(self, signal: FillSignal) {
        self.unregister();
        // No receivers is fine: nobody was waiting.
        let _ = self.sender.send(signal);
    }

    fn unregister(&self) {
        self.inflight
            .remove_if(&self.key, |_, sender| sender.same_channel(&self.sender));
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.unregister();
    }
}
