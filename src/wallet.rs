//! Cached wallet state and reconciliation against the node.
//!
//! The engine works from a local view of the wallet — nonce, native balance,
//! token balance — that it mutates optimistically as transactions go out and
//! receipts come back. [`WalletManager::load_state`] is the recovery path
//! from drift: it re-reads everything from the node and clobbers the local
//! values. The pipeline only invokes it while nothing is in flight, so a
//! reconciliation can never race a submission.

use alloy::primitives::{Address, U256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::config::FaucetConfig;
use crate::error::{PayoutError, RpcFault};
use crate::rpc::{BlockTag, EthRpc};
use crate::status::{derive_status, status_update, StatusSink, WALLET_STATUS_KEY};
use crate::tx::{SignedTx, TxBuilder, TxSpec};

/// Cached view of the faucet wallet.
#[derive(Debug, Clone, Default)]
pub struct WalletState {
    /// False until the first successful reconciliation, and again after a
    /// failed one.
    pub ready: bool,
    /// Next unused nonce.
    pub nonce: u64,
    pub native_balance: U256,
    /// Mirrors `native_balance` when the payout coin is native.
    pub token_balance: U256,
}

/// ERC-20 token identity with lazily resolved decimals.
pub struct TokenState {
    pub address: Address,
    decimals: OnceCell<u8>,
}

impl TokenState {
    fn new(address: Address) -> Self {
        Self {
            address,
            decimals: OnceCell::new(),
        }
    }

    async fn decimals(&self, rpc: &dyn EthRpc) -> Result<u8, RpcFault> {
        self.decimals
            .get_or_try_init(|| rpc.token_decimals(self.address))
            .await
            .copied()
    }
}

/// Owns the signer, the cached [`WalletState`] and the reconciliation logic.
pub struct WalletManager {
    rpc: Arc<dyn EthRpc>,
    config: Arc<FaucetConfig>,
    builder: TxBuilder,
    status: Arc<dyn StatusSink>,
    state: Mutex<WalletState>,
    /// 0 until known (configured or queried).
    chain_id: AtomicU64,
    token: Option<TokenState>,
    last_refresh: Mutex<Option<Instant>>,
}

impl WalletManager {
    pub fn new(
        config: Arc<FaucetConfig>,
        rpc: Arc<dyn EthRpc>,
        status: Arc<dyn StatusSink>,
    ) -> Result<Self, PayoutError> {
        let builder = TxBuilder::new(&config)?;
        let token = if config.is_token() {
            let address = config.coin_contract.ok_or_else(|| {
                PayoutError::Config("coin_contract is required in erc20 mode".to_string())
            })?;
            Some(TokenState::new(address))
        } else {
            None
        };
        Ok(Self {
            rpc,
            builder,
            status,
            state: Mutex::new(WalletState::default()),
            chain_id: AtomicU64::new(config.chain_id.unwrap_or(0)),
            token,
            last_refresh: Mutex::new(None),
            config,
        })
    }

    /// The faucet wallet address.
    pub fn address(&self) -> Address {
        self.builder.address()
    }

    /// Payout token contract, in erc20 mode.
    pub fn token_address(&self) -> Option<Address> {
        self.token.as_ref().map(|t| t.address)
    }

    /// Snapshot of the cached state.
    pub fn state(&self) -> WalletState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    /// Next unused nonce per the cached view.
    pub fn current_nonce(&self) -> u64 {
        self.state.lock().unwrap().nonce
    }

    /// Reconcile the cached state against the node.
    ///
    /// Four reads run concurrently: native balance and nonce at the
    /// `pending` tag (falling back to `latest` on nodes that reject it),
    /// the chain id (skipped once known) and the token balance (token mode).
    /// Any failure marks the wallet not ready.
    pub async fn load_state(&self) -> Result<(), RpcFault> {
        let addr = self.address();
        let (balance, nonce, chain, token_balance) = tokio::join!(
            self.balance_with_fallback(addr),
            self.nonce_with_fallback(addr),
            self.resolve_chain_id(),
            self.load_token_balance(addr),
        );

        match (balance, nonce, chain, token_balance) {
            (Ok(native), Ok(nonce), Ok(chain_id), Ok(token)) => {
                let previous = self.chain_id.swap(chain_id, Ordering::Relaxed);
                if previous != chain_id {
                    tracing::info!(chain_id, "chain parameters initialized");
                }
                {
                    let mut state = self.state.lock().unwrap();
                    *state = WalletState {
                        ready: true,
                        nonce,
                        native_balance: native,
                        token_balance: token.unwrap_or(native),
                    };
                }
                *self.last_refresh.lock().unwrap() = Some(Instant::now());
                tracing::debug!(
                    wallet = %addr,
                    nonce,
                    native = %native,
                    "wallet state reconciled"
                );
                self.publish_status().await;
                Ok(())
            }
            (balance, nonce, chain, token) => {
                let fault = balance
                    .err()
                    .or_else(|| nonce.err())
                    .or_else(|| chain.err())
                    .or_else(|| token.err())
                    .unwrap_or_else(|| RpcFault::Call("unreachable".to_string()));
                self.state.lock().unwrap().ready = false;
                tracing::warn!(wallet = %addr, error = %fault, "wallet state reconciliation failed");
                self.publish_status().await;
                Err(fault)
            }
        }
    }

    async fn balance_with_fallback(&self, addr: Address) -> Result<U256, RpcFault> {
        match self.rpc.native_balance(addr, BlockTag::Pending).await {
            Err(e) if e.is_pending_tag_unsupported() => {
                tracing::warn!("node rejects the pending tag, reading balance at latest");
                self.rpc.native_balance(addr, BlockTag::Latest).await
            }
            other => other,
        }
    }

    async fn nonce_with_fallback(&self, addr: Address) -> Result<u64, RpcFault> {
        match self.rpc.transaction_count(addr, BlockTag::Pending).await {
            Err(e) if e.is_pending_tag_unsupported() => {
                tracing::warn!("node rejects the pending tag, reading nonce at latest");
                self.rpc.transaction_count(addr, BlockTag::Latest).await
            }
            other => other,
        }
    }

    async fn resolve_chain_id(&self) -> Result<u64, RpcFault> {
        let current = self.chain_id.load(Ordering::Relaxed);
        if current != 0 {
            return Ok(current);
        }
        self.rpc.chain_id().await
    }

    async fn load_token_balance(&self, addr: Address) -> Result<Option<U256>, RpcFault> {
        match &self.token {
            Some(token) => Ok(Some(self.rpc.token_balance(token.address, addr).await?)),
            None => Ok(None),
        }
    }

    /// Optimistic accounting for a successfully submitted payout: the nonce
    /// advances and the claim amount leaves the balance ahead of the receipt.
    pub async fn note_submitted(&self, amount: U256) {
        {
            let mut state = self.state.lock().unwrap();
            state.nonce += 1;
            state.token_balance = state.token_balance.saturating_sub(amount);
            if !self.config.is_token() {
                state.native_balance = state.native_balance.saturating_sub(amount);
            }
        }
        self.publish_status().await;
    }

    /// Nonce advance for transactions that move no payout funds (vault
    /// refill/overflow).
    pub fn advance_nonce(&self) {
        self.state.lock().unwrap().nonce += 1;
    }

    /// Optimistic accounting for a mined transaction's fee.
    pub async fn note_fee(&self, fee: U256) {
        {
            let mut state = self.state.lock().unwrap();
            state.native_balance = state.native_balance.saturating_sub(fee);
            if !self.config.is_token() {
                state.token_balance = state.token_balance.saturating_sub(fee);
            }
        }
        self.publish_status().await;
    }

    /// Sign a transaction under the reconciled chain id.
    pub async fn sign(&self, spec: TxSpec) -> Result<SignedTx, PayoutError> {
        let chain_id = self.chain_id.load(Ordering::Relaxed);
        if chain_id == 0 {
            return Err(PayoutError::TxBuild("chain id not initialized".to_string()));
        }
        self.builder
            .build_and_sign(self.rpc.as_ref(), chain_id, spec)
            .await
    }

    /// Decimals of the requested denomination: 18 for native, the token's
    /// `decimals()` (fetched once, then cached) otherwise.
    pub async fn decimals(&self, native: bool) -> Result<u8, RpcFault> {
        match (&self.token, native) {
            (Some(token), false) => token.decimals(self.rpc.as_ref()).await,
            _ => Ok(18),
        }
    }

    /// Render an amount for humans: floored to 3 decimal places, trailing
    /// zeros trimmed, suffixed with the coin symbol.
    pub async fn readable_amount(&self, amount: U256, native: bool) -> Result<String, RpcFault> {
        let decimals = self.decimals(native).await?;
        let symbol = if native { "ETH" } else { &self.config.coin_symbol };
        Ok(format_amount(amount, decimals, symbol))
    }

    /// Derive and publish the wallet status under the `"wallet"` key.
    pub async fn publish_status(&self) {
        let state = self.state();
        let status = derive_status(&state, &self.config);
        let readable = self
            .readable_amount(state.token_balance, !self.config.is_token())
            .await
            .unwrap_or_else(|_| state.token_balance.to_string());
        self.status
            .publish(WALLET_STATUS_KEY, status_update(status, &readable, &self.config));
    }

    /// Time since the last successful reconciliation. `None` when never
    /// reconciled or explicitly invalidated (provider reload).
    pub fn refresh_age(&self) -> Option<Duration> {
        self.last_refresh
            .lock()
            .unwrap()
            .map(|at| Instant::now().duration_since(at))
    }

    /// Force the next idle tick to reconcile.
    pub fn invalidate_refresh(&self) {
        *self.last_refresh.lock().unwrap() = None;
    }
}

/// Floor `amount` to 3 decimal places of the given denomination and trim
/// trailing zeros. `1.2349` tokens → `"1.234 TOKEN"`, whole numbers render
/// without a fraction.
pub fn format_amount(amount: U256, decimals: u8, symbol: &str) -> String {
    let milli = if decimals >= 3 {
        amount / U256::from(10u8).pow(U256::from(decimals - 3))
    } else {
        amount * U256::from(10u8).pow(U256::from(3 - decimals))
    };
    let whole = milli / U256::from(1000);
    let frac = (milli % U256::from(1000)).to::<u64>();
    if frac == 0 {
        format!("{whole} {symbol}")
    } else {
        let frac_str = format!("{frac:03}");
        format!("{whole}.{} {symbol}", frac_str.trim_end_matches('0'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::LogStatusSink;
    use crate::testutil::MockRpc;

    const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn manager(rpc: Arc<MockRpc>) -> WalletManager {
        let config = FaucetConfig {
            wallet_key: TEST_KEY.to_string(),
            chain_id: Some(1337),
            ..FaucetConfig::default()
        };
        WalletManager::new(Arc::new(config), rpc, Arc::new(LogStatusSink)).unwrap()
    }

    #[test]
    fn format_amount_floors_to_three_decimals() {
        let eighteen = |v: u128| U256::from(v);
        assert_eq!(
            format_amount(eighteen(1_234_900_000_000_000_000), 18, "TOKEN"),
            "1.234 TOKEN"
        );
        assert_eq!(
            format_amount(eighteen(1_000_000_000_000_000_000), 18, "ETH"),
            "1 ETH"
        );
        assert_eq!(
            format_amount(eighteen(1_200_000_000_000_000_000), 18, "ETH"),
            "1.2 ETH"
        );
        assert_eq!(format_amount(U256::ZERO, 18, "ETH"), "0 ETH");
        // Low-decimals token: 6 decimals, 2.5 units.
        assert_eq!(format_amount(U256::from(2_500_000u64), 6, "USDC"), "2.5 USDC");
        // Fewer than 3 decimals scales up.
        assert_eq!(format_amount(U256::from(25u64), 1, "X"), "2.5 X");
    }

    #[tokio::test]
    async fn load_state_reconciles_from_node() {
        let rpc = Arc::new(MockRpc::new());
        rpc.set_native_balance(U256::from(10u64).pow(U256::from(19u8)));
        rpc.set_nonce(5);
        let wallet = manager(rpc.clone());

        assert!(!wallet.is_ready());
        wallet.load_state().await.unwrap();

        let state = wallet.state();
        assert!(state.ready);
        assert_eq!(state.nonce, 5);
        assert_eq!(state.native_balance, U256::from(10u64).pow(U256::from(19u8)));
        // Native mode mirrors the balance.
        assert_eq!(state.token_balance, state.native_balance);
        assert!(wallet.refresh_age().is_some());
    }

    #[tokio::test]
    async fn load_state_falls_back_when_pending_unsupported() {
        let rpc = Arc::new(MockRpc::new());
        rpc.reject_pending_tag();
        rpc.set_native_balance(U256::from(42u64));
        rpc.set_nonce(7);
        let wallet = manager(rpc.clone());

        wallet.load_state().await.unwrap();
        let state = wallet.state();
        assert_eq!(state.nonce, 7);
        assert_eq!(state.native_balance, U256::from(42u64));
    }

    #[tokio::test]
    async fn load_state_failure_marks_offline() {
        let rpc = Arc::new(MockRpc::new());
        rpc.fail_reads("Connection refused");
        let wallet = manager(rpc.clone());

        assert!(wallet.load_state().await.is_err());
        assert!(!wallet.is_ready());
        assert!(wallet.refresh_age().is_none());
    }

    #[tokio::test]
    async fn optimistic_accounting_on_submission_and_fee() {
        let rpc = Arc::new(MockRpc::new());
        rpc.set_native_balance(U256::from(1_000_000u64));
        rpc.set_nonce(1);
        let wallet = manager(rpc.clone());
        wallet.load_state().await.unwrap();

        wallet.note_submitted(U256::from(300_000u64)).await;
        let state = wallet.state();
        assert_eq!(state.nonce, 2);
        assert_eq!(state.native_balance, U256::from(700_000u64));
        assert_eq!(state.token_balance, U256::from(700_000u64));

        wallet.note_fee(U256::from(50_000u64)).await;
        let state = wallet.state();
        assert_eq!(state.native_balance, U256::from(650_000u64));
        assert_eq!(state.token_balance, U256::from(650_000u64));

        wallet.advance_nonce();
        assert_eq!(wallet.current_nonce(), 3);
    }

    #[tokio::test]
    async fn status_published_under_wallet_key() {
        use crate::status::{StatusLevel, StatusUpdate};

        #[derive(Default)]
        struct RecordingSink {
            published: std::sync::Mutex<Vec<(String, Option<StatusUpdate>)>>,
        }
        impl crate::status::StatusSink for RecordingSink {
            fn publish(&self, key: &str, update: Option<StatusUpdate>) {
                self.published
                    .lock()
                    .unwrap()
                    .push((key.to_string(), update));
            }
        }

        let rpc = Arc::new(MockRpc::new());
        let sink = Arc::new(RecordingSink::default());
        let config = FaucetConfig {
            wallet_key: TEST_KEY.to_string(),
            chain_id: Some(1337),
            ..FaucetConfig::default()
        };
        let wallet = WalletManager::new(Arc::new(config), rpc.clone(), sink.clone()).unwrap();

        // Offline before the first reconciliation.
        wallet.publish_status().await;
        // Healthy after a successful one.
        rpc.set_native_balance(U256::from(10u64).pow(U256::from(19u8)));
        wallet.load_state().await.unwrap();

        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|(key, _)| key == "wallet"));
        assert_eq!(
            published[0].1.as_ref().map(|u| u.level),
            Some(StatusLevel::Error)
        );
        // The healthy emission clears the keyed entry.
        assert!(published[1].1.is_none());
    }

    #[tokio::test]
    async fn token_decimals_fetched_once() {
        let rpc = Arc::new(MockRpc::new());
        rpc.set_token_decimals(6);
        rpc.set_token_balance(U256::from(5_000_000u64));
        let config = FaucetConfig {
            wallet_key: TEST_KEY.to_string(),
            chain_id: Some(1337),
            coin_type: crate::config::CoinType::Erc20,
            coin_contract: Some(Address::repeat_byte(0xee)),
            coin_symbol: "USDC".to_string(),
            ..FaucetConfig::default()
        };
        let wallet =
            WalletManager::new(Arc::new(config), rpc.clone(), Arc::new(LogStatusSink)).unwrap();

        assert_eq!(wallet.decimals(false).await.unwrap(), 6);
        assert_eq!(wallet.decimals(false).await.unwrap(), 6);
        assert_eq!(rpc.token_decimals_queries(), 1);
        // The native denomination always reads as 18.
        assert_eq!(wallet.decimals(true).await.unwrap(), 18);

        assert_eq!(
            wallet
                .readable_amount(U256::from(5_000_000u64), false)
                .await
                .unwrap(),
            "5 USDC"
        );
    }

    #[tokio::test]
    async fn invalidate_refresh_clears_age() {
        let rpc = Arc::new(MockRpc::new());
        let wallet = manager(rpc.clone());
        wallet.load_state().await.unwrap();
        assert!(wallet.refresh_age().is_some());
        wallet.invalidate_refresh();
        assert!(wallet.refresh_age().is_none());
    }
}
