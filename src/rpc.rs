//! RPC seam and its alloy-backed implementation.
//!
//! The pipeline talks to the chain exclusively through [`EthRpc`], a narrow
//! trait covering the reads and the raw-transaction submission the engine
//! needs. [`EvmRpc`] implements it over an alloy [`RootProvider`] whose
//! transport is selected from the endpoint string: `ws://`/`wss://` for a
//! persistent connection, a leading `/` for a local IPC socket, HTTP
//! otherwise.
//!
//! Submission decomposes the node's pending-transaction object into two
//! parts: the hash (known immediately) and a boxed receipt future. A watcher
//! timeout surfaces as [`RpcFault::ReceiptTimeout`] so the caller can fall
//! back to polling `eth_getTransactionReceipt`; the poller only needs the
//! hash, so it survives a provider rebuild.

use alloy::network::{Ethereum, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{PendingTransactionError, Provider, RootProvider, WatchTxError};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::sol;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use crate::error::RpcFault;

sol! {
    /// Minimal ERC-20 surface the faucet needs.
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function decimals() external view returns (uint8);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

/// Delay before a torn-down provider is rebuilt.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// How long the receipt watcher waits before handing over to the poll loop.
const RECEIPT_WATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Block tag for balance and nonce reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    /// Includes mempool state. Not every node supports it; see
    /// [`RpcFault::is_pending_tag_unsupported`].
    Pending,
}

/// The receipt fields the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutReceipt {
    pub tx_hash: B256,
    pub block: u64,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    /// False means the transaction reverted on-chain.
    pub success: bool,
}

impl PayoutReceipt {
    /// `effective_gas_price × gas_used`.
    pub fn fee(&self) -> U256 {
        U256::from(self.effective_gas_price) * U256::from(self.gas_used)
    }
}

/// Receipt half of a submitted transaction.
pub type ReceiptFuture = BoxFuture<'static, Result<PayoutReceipt, RpcFault>>;

/// A raw transaction accepted by the node: the hash resolves at submission,
/// the receipt later.
pub struct SubmittedTx {
    pub hash: B256,
    pub receipt: ReceiptFuture,
}

/// Chain operations the engine depends on.
#[async_trait]
pub trait EthRpc: Send + Sync {
    async fn native_balance(&self, addr: Address, tag: BlockTag) -> Result<U256, RpcFault>;
    async fn transaction_count(&self, addr: Address, tag: BlockTag) -> Result<u64, RpcFault>;
    async fn chain_id(&self) -> Result<u64, RpcFault>;
    async fn gas_price(&self) -> Result<u128, RpcFault>;
    /// Deployed bytecode as a `0x`-prefixed hex string.
    async fn code_at(&self, addr: Address) -> Result<String, RpcFault>;
    async fn transaction_receipt(&self, hash: B256) -> Result<Option<PayoutReceipt>, RpcFault>;
    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<SubmittedTx, RpcFault>;
    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, RpcFault>;
    async fn token_decimals(&self, token: Address) -> Result<u8, RpcFault>;
    /// Plain `eth_call` against a contract.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcFault>;
}

/// Alloy-backed [`EthRpc`].
pub struct EvmRpc {
    endpoint: String,
    provider: RwLock<RootProvider<Ethereum>>,
    reload_tx: watch::Sender<u64>,
}

impl EvmRpc {
    /// Connect to the endpoint, selecting the transport from its scheme.
    pub async fn connect(endpoint: &str) -> Result<Self, RpcFault> {
        let provider = Self::build(endpoint).await?;
        let (reload_tx, _) = watch::channel(0);
        tracing::info!(endpoint, "rpc provider connected");
        Ok(Self {
            endpoint: endpoint.to_string(),
            provider: RwLock::new(provider),
            reload_tx,
        })
    }

    /// Tear down the current provider and connect a fresh one after the
    /// reconnect delay, then bump the reload generation. Subscribers use the
    /// generation to invalidate their wallet-refresh timestamps.
    pub async fn reload(&self) -> Result<(), RpcFault> {
        tracing::error!(endpoint = %self.endpoint, "rpc connection lost, scheduling reconnect");
        tokio::time::sleep(RECONNECT_DELAY).await;
        let fresh = Self::build(&self.endpoint).await?;
        *self.provider.write().await = fresh;
        self.reload_tx.send_modify(|generation| *generation += 1);
        tracing::info!(endpoint = %self.endpoint, "rpc provider rebuilt");
        Ok(())
    }

    /// Reload generation channel; bumps whenever the provider is rebuilt.
    pub fn reload_events(&self) -> watch::Receiver<u64> {
        self.reload_tx.subscribe()
    }

    async fn build(endpoint: &str) -> Result<RootProvider<Ethereum>, RpcFault> {
        // Alloy's connection-string handling performs the transport
        // dispatch: ws/wss → pubsub, path → IPC, otherwise HTTP.
        RootProvider::connect(endpoint)
            .await
            .map_err(RpcFault::categorize)
    }

    async fn provider(&self) -> RootProvider<Ethereum> {
        self.provider.read().await.clone()
    }
}

fn convert_receipt(receipt: TransactionReceipt) -> PayoutReceipt {
    PayoutReceipt {
        tx_hash: receipt.transaction_hash,
        block: receipt.block_number.unwrap_or_default(),
        gas_used: receipt.gas_used,
        effective_gas_price: receipt.effective_gas_price,
        success: receipt.status(),
    }
}

#[async_trait]
impl EthRpc for EvmRpc {
    async fn native_balance(&self, addr: Address, tag: BlockTag) -> Result<U256, RpcFault> {
        let provider = self.provider().await;
        let query = provider.get_balance(addr);
        let result = match tag {
            BlockTag::Pending => query.pending().await,
            BlockTag::Latest => query.latest().await,
        };
        result.map_err(RpcFault::categorize)
    }

    async fn transaction_count(&self, addr: Address, tag: BlockTag) -> Result<u64, RpcFault> {
        let provider = self.provider().await;
        let query = provider.get_transaction_count(addr);
        let result = match tag {
            BlockTag::Pending => query.pending().await,
            BlockTag::Latest => query.latest().await,
        };
        result.map_err(RpcFault::categorize)
    }

    async fn chain_id(&self) -> Result<u64, RpcFault> {
        self.provider()
            .await
            .get_chain_id()
            .await
            .map_err(RpcFault::categorize)
    }

    async fn gas_price(&self) -> Result<u128, RpcFault> {
        self.provider()
            .await
            .get_gas_price()
            .await
            .map_err(RpcFault::categorize)
    }

    async fn code_at(&self, addr: Address) -> Result<String, RpcFault> {
        let code = self
            .provider()
            .await
            .get_code_at(addr)
            .await
            .map_err(RpcFault::categorize)?;
        Ok(format!("0x{}", alloy::hex::encode(code)))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<PayoutReceipt>, RpcFault> {
        let receipt = self
            .provider()
            .await
            .get_transaction_receipt(hash)
            .await
            .map_err(RpcFault::categorize)?;
        Ok(receipt.map(convert_receipt))
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<SubmittedTx, RpcFault> {
        let provider = self.provider().await;
        let pending = provider
            .send_raw_transaction(&raw)
            .await
            .map_err(RpcFault::categorize)?;
        let hash = *pending.tx_hash();
        let watcher = pending.with_timeout(Some(RECEIPT_WATCH_TIMEOUT));
        let receipt: ReceiptFuture = Box::pin(async move {
            match watcher.get_receipt().await {
                Ok(receipt) => Ok(convert_receipt(receipt)),
                Err(PendingTransactionError::TxWatcher(WatchTxError::Timeout)) => {
                    Err(RpcFault::ReceiptTimeout)
                }
                Err(e) => Err(RpcFault::categorize(e)),
            }
        });
        Ok(SubmittedTx { hash, receipt })
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, RpcFault> {
        let provider = self.provider().await;
        IERC20::new(token, provider)
            .balanceOf(owner)
            .call()
            .await
            .map_err(RpcFault::categorize)
    }

    async fn token_decimals(&self, token: Address) -> Result<u8, RpcFault> {
        let provider = self.provider().await;
        IERC20::new(token, provider)
            .decimals()
            .call()
            .await
            .map_err(RpcFault::categorize)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcFault> {
        let request = TransactionRequest::default().with_to(to).with_input(data);
        self.provider()
            .await
            .call(request)
            .await
            .map_err(RpcFault::categorize)
    }
}

/// Calldata for `transfer(to, amount)` on the payout token.
pub fn erc20_transfer_calldata(to: Address, amount: U256) -> Bytes {
    use alloy::sol_types::SolCall;
    IERC20::transferCall { to, amount }.abi_encode().into()
}

/// Cadence of the fallback receipt poll loop.
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Poll `eth_getTransactionReceipt` until the transaction surfaces.
///
/// Connection faults are absorbed and retried — the hash is all the poller
/// holds, so it keeps working across provider rebuilds. Any other fault is
/// terminal. There is no poll limit: an unmined transaction is polled until
/// it resolves one way or the other.
pub async fn poll_receipt(rpc: &dyn EthRpc, hash: B256) -> Result<PayoutReceipt, RpcFault> {
    loop {
        tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        match rpc.transaction_receipt(hash).await {
            Ok(Some(receipt)) => return Ok(receipt),
            Ok(None) => continue,
            Err(e) if e.is_connection() => {
                tracing::debug!(%hash, error = %e, "receipt poll hit a connection error, retrying");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}
