// Transformation coalescing
//
// Deduplicates concurrent requests for the same (image, parameter digest).
// The first caller (leader) runs the pipeline and records the result; later
// callers (followers) wait for the leader to finish and then read the
// ledger. A follower that finds nothing recorded (the leader failed) runs
// the transformation itself; the ledger's record-if-absent keeps the
// outcome correct either way.
//
// Coalescing is per process. Across instances the ledger is the only
// arbiter.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cache_key::CacheKey;
use crate::model::ImageId;

type SlotKey = (ImageId, CacheKey);

/// Tracks in-flight transformations
#[derive(Debug, Clone, Default)]
pub struct TransformCoalescer {
    in_flight: Arc<Mutex<HashMap<SlotKey, watch::Sender<bool>>>>,
}

impl TransformCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a slot for `(image_id, digest)`.
    ///
    /// Returns [`CoalescingSlot::Leader`] when no other transformation for
    /// the key is running. Otherwise waits for the running one to finish and
    /// returns [`CoalescingSlot::Follower`].
    pub async fn acquire(&self, image_id: &ImageId, digest: &CacheKey) -> CoalescingSlot {
        let key = (*image_id, digest.clone());

        let receiver = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(sender) => sender.subscribe(),
                None => {
                    let (tx, _rx) = watch::channel(false);
                    in_flight.insert(key.clone(), tx.clone());
                    return CoalescingSlot::Leader(LeaderGuard {
                        key,
                        coalescer: self.clone(),
                        sender: tx,
                    });
                }
            }
        };

        let mut rx = receiver;
        // Err means the leader's sender is gone, which also means it is done
        let _ = rx.wait_for(|&completed| completed).await;
        CoalescingSlot::Follower
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Only the leader inserts a key and only its guard removes it, so the
    /// entry present at release is always the caller's own
    fn release(&self, key: &SlotKey) {
        self.in_flight.lock().remove(key);
    }
}

/// Result of [`TransformCoalescer::acquire`]
#[derive(Debug)]
pub enum CoalescingSlot {
    /// Run the transformation; followers are released when the guard drops
    Leader(LeaderGuard),
    /// Another caller ran the transformation; consult the ledger
    Follower,
}

impl CoalescingSlot {
    pub fn is_leader(&self) -> bool {
        matches!(self, CoalescingSlot::Leader(_))
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, CoalescingSlot::Follower)
    }
}

/// Held by the leader. Dropping it, on success, error or cancellation,
/// wakes every follower.
#[derive(Debug)]
pub struct LeaderGuard {
    key: SlotKey,
    coalescer: TransformCoalescer,
    sender: watch::Sender<bool>,
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.coalescer.release(&self.key);
        let _ = self.sender.send(true);
    }
}
