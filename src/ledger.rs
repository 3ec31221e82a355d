//! Per-conversation append ordering.
//!
//! One turn appends to a conversation at a time. The guard also remembers
//! the highest sequence the conversation has produced so a store that hands
//! back a stale sequence is caught.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::TurnError;

struct Slot {
    gate: Arc<Semaphore>,
    high_water: AtomicU64,
}

/// Maps conversation ids to their append slot.
#[derive(Default)]
pub struct AppendLedger {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl AppendLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other turn is appending to `conversation_id`. The
    /// returned guard releases the conversation on drop.
    pub async fn acquire(&self, conversation_id: &str) -> Result<AppendGuard, TurnError> {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(conversation_id.to_owned())
                .or_insert_with(|| {
                    Arc::new(Slot {
                        gate: Arc::new(Semaphore::new(1)),
                        high_water: AtomicU64::new(0),
                    })
                })
                .clone()
        };

        let permit = slot
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TurnError::Ledger(e.to_string()))?;

        Ok(AppendGuard {
            _permit: permit,
            slot,
        })
    }

    /// Number of tracked conversations.
    pub fn conversation_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Highest sequence seen for a conversation, zero if none.
    pub fn high_water(&self, conversation_id: &str) -> u64 {
        self.slots
            .lock()
            .get(conversation_id)
            .map_or(0, |slot| slot.high_water.load(Ordering::Acquire))
    }

    /// Forget conversations nobody is appending to or waiting on. Their
    /// high-water marks are re-learned from the store on the next turn.
    pub fn prune_idle(&self) {
        // A clone outside the map is a holder or an `acquire` between the
        // map lookup and the permit.
        self.slots.lock().retain(|_, slot| {
            slot.gate.available_permits() == 0 || Arc::strong_count(slot) > 1
        });
    }
}

/// Exclusive append access to one conversation.
pub struct AppendGuard {
    _permit: OwnedSemaphorePermit,
    slot: Arc<Slot>,
}

impl AppendGuard {
    /// Record a sequence returned by the store. Returns false if it does not
    /// advance past everything already appended.
    pub fn observe(&self, sequence: u64) -> bool {
        let previous = self.slot.high_water.fetch_max(sequence, Ordering::AcqRel);
        sequence > previous
    }

    pub fn high_water(&self) -> u64 {
        self.slot.high_water.load(Ordering::Acquire)
    }
}
