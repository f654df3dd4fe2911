//! Durable claim queue seam.
//!
//! The engine persists the identity of every queued claim so a restart can
//! rebuild the queue in order. The backing store is an opaque small KV owned
//! by the embedder; implementations are expected to log their own failures —
//! the pipeline treats the store as best-effort and never blocks on it.

use std::sync::Mutex;

use crate::claim::StoredClaim;

/// Durable storage consumed by the pipeline.
///
/// Called synchronously from within the tick: once at startup to restore the
/// queue, on every enqueue and on every dequeue (submission or terminal
/// failure).
pub trait ClaimStore: Send + Sync {
    /// All queued claims in enqueue order. Restored order defines initial
    /// `queue_idx` assignment.
    fn load_claim_queue(&self) -> Vec<StoredClaim>;
    fn add_queued_claim(&self, claim: &StoredClaim);
    fn remove_queued_claim(&self, session: &str);
}

/// In-memory store, used by tests and by deployments that accept losing the
/// queue on restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<StoredClaim>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. to simulate a restart with queued claims.
    pub fn with_entries(entries: Vec<StoredClaim>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Snapshot of the stored entries, in order.
    pub fn entries(&self) -> Vec<StoredClaim> {
        self.entries.lock().unwrap().clone()
    }

    pub fn contains(&self, session: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.session == session)
    }
}

impl ClaimStore for MemoryStore {
    fn load_claim_queue(&self) -> Vec<StoredClaim> {
        self.entries.lock().unwrap().clone()
    }

    fn add_queued_claim(&self, claim: &StoredClaim) {
        self.entries.lock().unwrap().push(claim.clone());
    }

    fn remove_queued_claim(&self, session: &str) {
        self.entries.lock().unwrap().retain(|e| e.session != session);
    }
}
