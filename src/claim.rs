//! Claim lifecycle records.
//!
//! A [`ClaimTx`] is one payout request travelling through the pipeline. The
//! immutable identity (target, amount, session, queue ordinal) is plain
//! fields; everything learned during submission lives behind a lock in
//! [`ClaimOutcome`]. Each status transition fans out once, in order, over a
//! broadcast channel that any number of front-end sessions may subscribe to.

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

use crate::error::PayoutError;

/// Lifecycle state of a claim. Transitions are monotonic:
/// Queue → Processing → Pending → {Confirmed | Failed}, with Processing
/// allowed to fail directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClaimStatus {
    Queue,
    Processing,
    Pending,
    Confirmed,
    Failed,
}

impl ClaimStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClaimStatus::Confirmed | ClaimStatus::Failed)
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClaimStatus::Queue => "QUEUE",
            ClaimStatus::Processing => "PROCESSING",
            ClaimStatus::Pending => "PENDING",
            ClaimStatus::Confirmed => "CONFIRMED",
            ClaimStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Durable form of a queued claim. Only identity fields survive a restart;
/// submission state is rebuilt from the chain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoredClaim {
    /// Unix seconds of claim creation.
    pub time: u64,
    pub target: Address,
    pub amount: U256,
    pub session: String,
}

/// Mutable submission state of a claim.
#[derive(Debug, Clone, Default)]
pub struct ClaimOutcome {
    pub nonce: Option<u64>,
    /// Raw signed transaction, lowercase hex without `0x`.
    pub tx_hex: Option<String>,
    pub tx_hash: Option<B256>,
    pub tx_block: Option<u64>,
    /// `effective_gas_price × gas_used`, known at receipt time.
    pub tx_fee: Option<U256>,
    /// Kept for durability parity; the submission loop counts attempts
    /// locally and never reads this back.
    pub retry_count: u32,
    pub fail_reason: Option<String>,
}

struct ClaimCell {
    status: ClaimStatus,
    outcome: ClaimOutcome,
}

/// One payout request.
pub struct ClaimTx {
    /// Monotonic ordinal assigned at enqueue, stable for the process
    /// lifetime.
    pub queue_idx: u64,
    /// Unix seconds of creation (restored claims keep their original time).
    pub created_at: u64,
    pub target: Address,
    pub amount: U256,
    /// Opaque front-end session id, unique per active claim.
    pub session: String,
    cell: Mutex<ClaimCell>,
    events: broadcast::Sender<ClaimStatus>,
}

impl ClaimTx {
    pub fn new(queue_idx: u64, target: Address, amount: U256, session: String) -> Self {
        Self::with_created_at(queue_idx, now_unix(), target, amount, session)
    }

    /// Rebuild a claim restored from durable storage.
    pub fn restored(queue_idx: u64, stored: StoredClaim) -> Self {
        Self::with_created_at(
            queue_idx,
            stored.time,
            stored.target,
            stored.amount,
            stored.session,
        )
    }

    fn with_created_at(
        queue_idx: u64,
        created_at: u64,
        target: Address,
        amount: U256,
        session: String,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            queue_idx,
            created_at,
            target,
            amount,
            session,
            cell: Mutex::new(ClaimCell {
                status: ClaimStatus::Queue,
                outcome: ClaimOutcome::default(),
            }),
            events,
        }
    }

    pub fn status(&self) -> ClaimStatus {
        self.cell.lock().unwrap().status
    }

    /// Snapshot of the submission state.
    pub fn outcome(&self) -> ClaimOutcome {
        self.cell.lock().unwrap().outcome.clone()
    }

    /// Subscribe to status transitions. Each transition is delivered once,
    /// in order; subscribers that lag past the channel capacity observe a
    /// `Lagged` error, never a duplicate.
    pub fn subscribe(&self) -> broadcast::Receiver<ClaimStatus> {
        self.events.subscribe()
    }

    /// Advance the lifecycle. Backward and repeated transitions are ignored;
    /// terminal states stick.
    pub fn set_status(&self, status: ClaimStatus) {
        let mut cell = self.cell.lock().unwrap();
        if cell.status.is_terminal() || status <= cell.status {
            return;
        }
        cell.status = status;
        drop(cell);
        // Nobody listening is fine.
        let _ = self.events.send(status);
    }

    /// Record a successful submission: the nonce it was signed with, the raw
    /// hex and the node-assigned hash.
    pub fn record_submission(&self, nonce: u64, tx_hex: String, tx_hash: B256) {
        let mut cell = self.cell.lock().unwrap();
        cell.outcome.nonce = Some(nonce);
        cell.outcome.tx_hex = Some(tx_hex);
        cell.outcome.tx_hash = Some(tx_hash);
    }

    pub fn record_retry(&self) {
        self.cell.lock().unwrap().outcome.retry_count += 1;
    }

    /// Record the nonce of a submission attempt that never yielded a hash,
    /// so a claim failed after attempting still shows what it signed with.
    pub fn record_attempted_nonce(&self, nonce: u64) {
        self.cell.lock().unwrap().outcome.nonce = Some(nonce);
    }

    /// Record receipt data on confirmation.
    pub fn record_receipt(&self, block: u64, fee: U256) {
        let mut cell = self.cell.lock().unwrap();
        cell.outcome.tx_block = Some(block);
        cell.outcome.tx_fee = Some(fee);
    }

    /// Mark the claim failed with a reason.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut cell = self.cell.lock().unwrap();
            if cell.status.is_terminal() {
                return;
            }
            cell.outcome.fail_reason = Some(reason);
            cell.status = ClaimStatus::Failed;
        }
        let _ = self.events.send(ClaimStatus::Failed);
    }

    /// Durable form: identity only.
    pub fn to_stored(&self) -> StoredClaim {
        StoredClaim {
            time: self.created_at,
            target: self.target,
            amount: self.amount,
            session: self.session.clone(),
        }
    }
}

impl std::fmt::Debug for ClaimTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimTx")
            .field("queue_idx", &self.queue_idx)
            .field("session", &self.session)
            .field("target", &self.target)
            .field("amount", &self.amount)
            .field("status", &self.status())
            .finish()
    }
}

/// Parse a claim target address.
///
/// An exact `0X` prefix is rewritten to `0x` before parsing; no other case
/// normalization is applied.
pub fn parse_claim_target(input: &str) -> Result<Address, PayoutError> {
    let normalized = match input.strip_prefix("0X") {
        Some(rest) => format!("0x{rest}"),
        None => input.to_string(),
    };
    Address::from_str(&normalized).map_err(|_| PayoutError::InvalidAddress(input.to_string()))
}

/// Current unix time in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
