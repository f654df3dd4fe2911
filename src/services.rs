//! Collaborator bundle handed to the pipeline at construction.
//!
//! The engine's external collaborators — durable claim storage, the status
//! surface, the statistics logger and the proof-of-work reward limiter — are
//! carried as one explicit bundle instead of process-wide singletons. Every
//! seam has a no-op default so embedders wire only what they use.

use alloy::primitives::U256;
use async_trait::async_trait;
use std::sync::Arc;

use crate::claim::ClaimTx;
use crate::status::{LogStatusSink, StatusSink};
use crate::store::{ClaimStore, MemoryStore};

/// Outstanding reward liability the wallet must stay solvent against.
///
/// Consulted by the refill controller when computing the effective balance:
/// rewards that users have earned but not yet claimed are money the wallet
/// already owes.
#[async_trait]
pub trait RewardLiability: Send + Sync {
    async fn unclaimed_liability(&self) -> U256;
}

/// No outstanding liability.
pub struct NoRewards;

#[async_trait]
impl RewardLiability for NoRewards {
    async fn unclaimed_liability(&self) -> U256 {
        U256::ZERO
    }
}

/// Receives one record per confirmed claim.
pub trait ClaimStatsSink: Send + Sync {
    fn record_claim(&self, claim: &ClaimTx);
}

/// Discards statistics.
pub struct NoStats;

impl ClaimStatsSink for NoStats {
    fn record_claim(&self, _claim: &ClaimTx) {}
}

/// The full collaborator bundle.
pub struct FaucetServices {
    pub store: Arc<dyn ClaimStore>,
    pub status: Arc<dyn StatusSink>,
    pub stats: Arc<dyn ClaimStatsSink>,
    pub rewards: Arc<dyn RewardLiability>,
}

impl Default for FaucetServices {
    fn default() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            status: Arc::new(LogStatusSink),
            stats: Arc::new(NoStats),
            rewards: Arc::new(NoRewards),
        }
    }
}

impl FaucetServices {
    pub fn new(store: Arc<dyn ClaimStore>) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn ClaimStatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_rewards(mut self, rewards: Arc<dyn RewardLiability>) -> Self {
        self.rewards = rewards;
        self
    }
}
