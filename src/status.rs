//! Wallet status derivation and publication.
//!
//! The engine folds wallet state into a coarse four-tier status and pushes a
//! human-readable message to a [`StatusSink`] under the fixed key `"wallet"`,
//! so each emission replaces the previous one on whatever surface the
//! embedder renders (status bar, banner, health endpoint).

use crate::config::FaucetConfig;
use crate::wallet::WalletState;

const DEFAULT_LOW_FUNDS_WARNING: &str =
    "The faucet is running out of funds! Faucet Balance: {1}";
const DEFAULT_NO_FUNDS_ERROR: &str = "The faucet is out of funds!";
const DEFAULT_RPC_CONNECTION_ERROR: &str =
    "The faucet could not connect to the network RPC host!";

/// Key all wallet status emissions are published under.
pub const WALLET_STATUS_KEY: &str = "wallet";

/// Coarse wallet health tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletStatus {
    Normal,
    LowFunds,
    NoFunds,
    Offline,
}

/// Severity attached to a published status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Warning,
    Error,
}

/// A status message ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub level: StatusLevel,
    pub text: String,
}

/// Receives status updates from the engine. `None` clears the keyed entry.
pub trait StatusSink: Send + Sync {
    fn publish(&self, key: &str, update: Option<StatusUpdate>);
}

/// Default sink: renders status updates to the tracing log.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn publish(&self, key: &str, update: Option<StatusUpdate>) {
        match update {
            Some(StatusUpdate {
                level: StatusLevel::Error,
                text,
            }) => tracing::error!(key, "{text}"),
            Some(StatusUpdate {
                level: StatusLevel::Warning,
                text,
            }) => tracing::warn!(key, "{text}"),
            None => tracing::info!(key, "status cleared"),
        }
    }
}

/// Derive the status tier from the cached wallet state.
pub fn derive_status(state: &WalletState, config: &FaucetConfig) -> WalletStatus {
    if !state.ready {
        WalletStatus::Offline
    } else if state.token_balance <= config.no_funds_balance
        || state.native_balance <= config.gas_reserve()
    {
        WalletStatus::NoFunds
    } else if state.token_balance <= config.low_funds_balance {
        WalletStatus::LowFunds
    } else {
        WalletStatus::Normal
    }
}

/// Resolve the user-facing message for a tier. `readable_balance` replaces
/// the `{1}` placeholder. Suppressed messages and the Normal tier yield
/// `None`, which clears the published entry.
pub fn status_update(
    status: WalletStatus,
    readable_balance: &str,
    config: &FaucetConfig,
) -> Option<StatusUpdate> {
    let (setting, default_text, level) = match status {
        WalletStatus::Normal => return None,
        WalletStatus::LowFunds => (
            &config.low_funds_warning,
            DEFAULT_LOW_FUNDS_WARNING,
            StatusLevel::Warning,
        ),
        WalletStatus::NoFunds => (
            &config.no_funds_error,
            DEFAULT_NO_FUNDS_ERROR,
            StatusLevel::Error,
        ),
        WalletStatus::Offline => (
            &config.rpc_connection_error,
            DEFAULT_RPC_CONNECTION_ERROR,
            StatusLevel::Error,
        ),
    };
    let text = setting.resolve(default_text)?.replace("{1}", readable_balance);
    Some(StatusUpdate { level, text })
}
