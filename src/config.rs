//! Configuration for the payout engine.
//!
//! Loaded from a TOML file via the `config` crate. Every field has a default
//! so a minimal deployment only needs `rpc_host` and `wallet_key`; the refill
//! section is absent unless a vault contract is managed.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which asset the faucet pays out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinType {
    /// Pay out the chain's native coin.
    Native,
    /// Pay out an ERC-20 token (`coin_contract` required).
    Erc20,
}

/// A user-facing status message toggle: explicit text, `true` for the built-in
/// default text, or `false` to suppress the message entirely.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageSetting {
    Toggle(bool),
    Text(String),
}

impl Default for MessageSetting {
    fn default() -> Self {
        MessageSetting::Toggle(true)
    }
}

impl MessageSetting {
    /// Resolve against the built-in default text. `None` means suppressed.
    pub fn resolve(&self, default_text: &str) -> Option<String> {
        match self {
            MessageSetting::Toggle(false) => None,
            MessageSetting::Toggle(true) => Some(default_text.to_string()),
            MessageSetting::Text(text) => Some(text.clone()),
        }
    }
}

/// Which account's native balance gates a refill withdrawal.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ContractBalanceCheck {
    /// `true` checks the vault contract itself; `false` disables the check.
    Toggle(bool),
    /// Check a specific address instead of the vault.
    Address(Address),
}

impl Default for ContractBalanceCheck {
    fn default() -> Self {
        ContractBalanceCheck::Toggle(false)
    }
}

impl ContractBalanceCheck {
    /// The address to probe, given the vault contract. `None` disables.
    pub fn target(&self, vault: Address) -> Option<Address> {
        match self {
            ContractBalanceCheck::Toggle(false) => None,
            ContractBalanceCheck::Toggle(true) => Some(vault),
            ContractBalanceCheck::Address(addr) => Some(*addr),
        }
    }
}

/// Refill/overflow policy against a vault contract.
///
/// Argument templates for `allowance_fn` / `withdraw_fn` / `deposit_fn`
/// accept the placeholders `{walletAddr}`, `{amount}` and `{token}`; values
/// are coerced to the ABI input types at call time.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefillConfig {
    /// Vault contract address.
    pub contract: Address,
    /// JSON ABI of the vault contract.
    pub abi: String,
    /// Refill when the effective balance drops below this.
    pub trigger_balance: U256,
    /// Overflow excess into the vault when the effective balance exceeds this.
    pub overflow_balance: Option<U256>,
    /// Amount requested per refill (may be capped by allowance and vault
    /// balance).
    pub request_amount: U256,
    /// Seconds between successful refills.
    pub cooldown_time: u64,
    /// Optional view function returning the wallet's withdraw allowance.
    pub allowance_fn: Option<String>,
    pub allowance_fn_args: Vec<String>,
    /// Withdraw entry point called to refill the wallet.
    pub withdraw_fn: String,
    pub withdraw_fn_args: Vec<String>,
    /// Gas limit for vault transactions.
    pub withdraw_gas_limit: u64,
    /// Optional deposit entry point attached to overflow transfers.
    pub deposit_fn: Option<String>,
    pub deposit_fn_args: Vec<String>,
    /// Skip refills when the probed account's native balance is dust.
    pub check_contract_balance: ContractBalanceCheck,
    /// Dust threshold for the balance check.
    pub contract_dust_balance: U256,
}

impl Default for RefillConfig {
    fn default() -> Self {
        Self {
            contract: Address::ZERO,
            abi: String::new(),
            trigger_balance: U256::ZERO,
            overflow_balance: None,
            request_amount: U256::ZERO,
            cooldown_time: 3600,
            allowance_fn: None,
            allowance_fn_args: vec![],
            withdraw_fn: "withdraw".to_string(),
            withdraw_fn_args: vec![],
            withdraw_gas_limit: 300_000,
            deposit_fn: None,
            deposit_fn_args: vec![],
            check_contract_balance: ContractBalanceCheck::default(),
            contract_dust_balance: U256::from(1_000_000_000u64),
        }
    }
}

impl RefillConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_time)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FaucetConfig {
    /// JSON-RPC endpoint. `ws://`/`wss://` use a persistent connection, a
    /// leading `/` selects a local IPC socket, anything else is HTTP.
    pub rpc_host: String,
    /// Chain id. Queried from the node at startup when absent.
    pub chain_id: Option<u64>,
    /// Hex-encoded secp256k1 private key of the faucet wallet (`0x` optional).
    pub wallet_key: String,
    /// Sign legacy transactions instead of EIP-1559.
    pub legacy_tx: bool,
    /// Gas limit for payout transactions.
    pub tx_gas_limit: u64,
    /// Max fee per gas (wei). Doubles as the legacy gas-price cap when
    /// non-zero.
    pub tx_max_fee: u128,
    /// Priority fee per gas (wei).
    pub tx_prio_fee: u128,
    /// In-flight transaction cap.
    pub max_pending: usize,
    /// Stop draining the queue while the wallet cannot cover the head claim.
    pub queue_no_funds: bool,
    /// Reserve kept on top of each claim when checking coverage.
    pub spare_funds_amount: U256,
    /// Token balance at or below which the faucet reports NOFUNDS.
    pub no_funds_balance: U256,
    /// Token balance at or below which the faucet reports LOWFUNDS.
    pub low_funds_balance: U256,
    pub low_funds_warning: MessageSetting,
    pub no_funds_error: MessageSetting,
    pub rpc_connection_error: MessageSetting,
    /// Payout asset kind.
    pub coin_type: CoinType,
    /// ERC-20 token contract (erc20 mode).
    pub coin_contract: Option<Address>,
    /// Token symbol used in readable amounts.
    pub coin_symbol: String,
    /// Vault refill policy. Absent disables the refill controller.
    pub refill: Option<RefillConfig>,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            rpc_host: "http://127.0.0.1:8545".to_string(),
            chain_id: None,
            wallet_key: String::new(),
            legacy_tx: false,
            tx_gas_limit: 21_000,
            tx_max_fee: 1_800_000_000,
            tx_prio_fee: 800_000_000,
            max_pending: 12,
            queue_no_funds: false,
            spare_funds_amount: U256::ZERO,
            no_funds_balance: U256::ZERO,
            low_funds_balance: U256::ZERO,
            low_funds_warning: MessageSetting::default(),
            no_funds_error: MessageSetting::default(),
            rpc_connection_error: MessageSetting::default(),
            coin_type: CoinType::Native,
            coin_contract: None,
            coin_symbol: "ETH".to_string(),
            refill: None,
        }
    }
}

impl FaucetConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()
    }

    /// Load from the path in `FAUCET_CONFIG`, or `faucet.toml`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("FAUCET_CONFIG").unwrap_or_else(|_| "faucet.toml".to_string());
        Self::from_file(config_path)
    }

    /// Worst-case gas cost of one payout transaction, in wei.
    pub fn gas_reserve(&self) -> U256 {
        U256::from(self.tx_gas_limit) * U256::from(self.tx_max_fee)
    }

    /// True when payouts move an ERC-20 token rather than the native coin.
    pub fn is_token(&self) -> bool {
        self.coin_type == CoinType::Erc20
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_setting_resolution() {
        assert_eq!(
            MessageSetting::Toggle(true).resolve("default"),
            Some("default".to_string())
        );
        assert_eq!(MessageSetting::Toggle(false).resolve("default"), None);
        assert_eq!(
            MessageSetting::Text("custom {1}".to_string()).resolve("default"),
            Some("custom {1}".to_string())
        );
    }

    #[test]
    fn contract_balance_check_target() {
        let vault = Address::repeat_byte(0x11);
        let other = Address::repeat_byte(0x22);
        assert_eq!(ContractBalanceCheck::Toggle(false).target(vault), None);
        assert_eq!(ContractBalanceCheck::Toggle(true).target(vault), Some(vault));
        assert_eq!(
            ContractBalanceCheck::Address(other).target(vault),
            Some(other)
        );
    }

    #[test]
    fn gas_reserve_is_limit_times_max_fee() {
        let cfg = FaucetConfig {
            tx_gas_limit: 21_000,
            tx_max_fee: 2_000_000_000,
            ..FaucetConfig::default()
        };
        assert_eq!(cfg.gas_reserve(), U256::from(42_000_000_000_000u64));
    }

    #[test]
    fn refill_defaults() {
        let refill = RefillConfig::default();
        assert_eq!(refill.contract_dust_balance, U256::from(1_000_000_000u64));
        assert_eq!(refill.cooldown(), Duration::from_secs(3600));
    }
}
