//! Error types for the payout engine.
//!
//! Two layers:
//! - [`RpcFault`] — what the RPC seam reports. Callers branch on the variant:
//!   `Connection` is retryable, `ReceiptTimeout` switches the receipt watcher
//!   to polling, `Call` is terminal for the operation at hand.
//! - [`PayoutError`] — what the engine API surfaces to its embedder.

use thiserror::Error;

/// Marker the node emits when it does not implement the `pending` block tag.
const PENDING_TAG_UNSUPPORTED: &str = "\"pending\" is not yet supported";

/// Fault reported by an [`EthRpc`](crate::rpc::EthRpc) operation.
#[derive(Debug, Clone, Error)]
pub enum RpcFault {
    /// Transport-level failure: refused/reset connection, DNS, timeout.
    /// Retryable wherever the caller can wait.
    #[error("rpc connection error: {0}")]
    Connection(String),
    /// The receipt watcher gave up before the transaction was mined.
    /// Not a failure — the caller falls back to `eth_getTransactionReceipt`
    /// polling.
    #[error("transaction was not mined within the receipt watch window")]
    ReceiptTimeout,
    /// The node answered with an error (rejected tx, revert data, bad params).
    #[error("rpc call failed: {0}")]
    Call(String),
}

impl RpcFault {
    /// True for transport-level faults that a poll loop should absorb.
    pub fn is_connection(&self) -> bool {
        matches!(self, RpcFault::Connection(_))
    }

    /// True when the node rejected the `pending` block tag; reads retry at
    /// `latest`.
    pub fn is_pending_tag_unsupported(&self) -> bool {
        match self {
            RpcFault::Call(msg) => msg.contains(PENDING_TAG_UNSUPPORTED),
            _ => false,
        }
    }

    /// Categorize an alloy transport/provider error into a fault.
    ///
    /// Connection-shaped messages become [`RpcFault::Connection`]; everything
    /// else is a plain [`RpcFault::Call`] carrying the debug rendering.
    pub fn categorize(e: impl std::fmt::Debug) -> Self {
        let err_str = format!("{e:?}");
        if err_str.contains("Connection refused")
            || err_str.contains("Connection reset")
            || err_str.contains("No route to host")
            || err_str.contains("CONNECTION ERROR")
            || err_str.contains("timeout")
            || err_str.contains("Timeout")
            || err_str.contains("dns error")
            || err_str.contains("BackendGone")
        {
            RpcFault::Connection(err_str)
        } else {
            RpcFault::Call(err_str)
        }
    }
}

/// Error surfaced by the engine's public API.
#[derive(Debug, Error)]
pub enum PayoutError {
    /// A claim with this session id already exists in queue, pending, or
    /// recent history.
    #[error("duplicate claim session: {0}")]
    DuplicateSession(String),
    /// The claim target could not be parsed as a 20-byte address.
    #[error("invalid target address: {0}")]
    InvalidAddress(String),
    /// The configured wallet key is not a valid secp256k1 private key.
    #[error("invalid wallet key: {0}")]
    InvalidWalletKey(String),
    /// The configuration is unusable for the selected mode.
    #[error("configuration error: {0}")]
    Config(String),
    /// Refill configuration is unusable (bad ABI, unknown function, bad args).
    #[error("refill configuration error: {0}")]
    RefillConfig(String),
    /// A refill or overflow attempt failed.
    #[error("refill failed: {0}")]
    RefillFailed(String),
    /// Transaction construction or signing failed.
    #[error("transaction build failed: {0}")]
    TxBuild(String),
    #[error(transparent)]
    Rpc(#[from] RpcFault),
}
