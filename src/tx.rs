//! Transaction construction and signing.
//!
//! Two modes, selected once by configuration:
//! - **EIP-1559** (default): the fee envelope is static — `max_fee_per_gas`
//!   and `max_priority_fee_per_gas` come straight from config, no gas-price
//!   query at build time.
//! - **Legacy**: the current node gas price plus the priority fee, capped at
//!   the configured max fee when the cap is non-zero.
//!
//! The signed envelope is EIP-2718 encoded; the hex rendering recorded on
//! claims carries no `0x` prefix.

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, Bytes, TxKind, U256};
use alloy::signers::local::PrivateKeySigner;

use crate::config::FaucetConfig;
use crate::error::{PayoutError, RpcFault};
use crate::rpc::EthRpc;

/// Everything that varies per transaction.
#[derive(Debug, Clone)]
pub struct TxSpec {
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    pub data: Bytes,
    /// Overrides the configured payout gas limit (vault calls use their own).
    pub gas_limit: Option<u64>,
}

/// A signed transaction ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw: Vec<u8>,
    /// Lowercase hex of `raw`, without `0x` prefix.
    pub hex: String,
}

/// Builds and signs payout transactions for the single faucet wallet.
pub struct TxBuilder {
    signer: PrivateKeySigner,
    legacy: bool,
    max_fee: u128,
    prio_fee: u128,
    default_gas_limit: u64,
}

impl TxBuilder {
    pub fn new(config: &FaucetConfig) -> Result<Self, PayoutError> {
        let key = config.wallet_key.strip_prefix("0x").unwrap_or(&config.wallet_key);
        let signer: PrivateKeySigner = key
            .parse()
            .map_err(|e| PayoutError::InvalidWalletKey(format!("{e}")))?;
        Ok(Self {
            signer,
            legacy: config.legacy_tx,
            max_fee: config.tx_max_fee,
            prio_fee: config.tx_prio_fee,
            default_gas_limit: config.tx_gas_limit,
        })
    }

    /// The wallet address transactions are signed from.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Build and sign a transaction under the given chain id.
    ///
    /// Legacy mode reaches out to the node for the current gas price; 1559
    /// mode signs without any RPC traffic.
    pub async fn build_and_sign(
        &self,
        rpc: &dyn EthRpc,
        chain_id: u64,
        spec: TxSpec,
    ) -> Result<SignedTx, PayoutError> {
        let gas_limit = spec.gas_limit.unwrap_or(self.default_gas_limit);
        let envelope = if self.legacy {
            let gas_price = self.legacy_gas_price(rpc).await?;
            let mut tx = TxLegacy {
                chain_id: Some(chain_id),
                nonce: spec.nonce,
                gas_price,
                gas_limit,
                to: TxKind::Call(spec.to),
                value: spec.value,
                input: spec.data,
            };
            let signature = self
                .signer
                .sign_transaction_sync(&mut tx)
                .map_err(|e| PayoutError::TxBuild(format!("{e}")))?;
            TxEnvelope::from(tx.into_signed(signature))
        } else {
            let mut tx = TxEip1559 {
                chain_id,
                nonce: spec.nonce,
                gas_limit,
                max_fee_per_gas: self.max_fee,
                max_priority_fee_per_gas: self.prio_fee,
                to: TxKind::Call(spec.to),
                value: spec.value,
                access_list: Default::default(),
                input: spec.data,
            };
            let signature = self
                .signer
                .sign_transaction_sync(&mut tx)
                .map_err(|e| PayoutError::TxBuild(format!("{e}")))?;
            TxEnvelope::from(tx.into_signed(signature))
        };

        let raw = envelope.encoded_2718();
        let hex = alloy::hex::encode(&raw);
        Ok(SignedTx { raw, hex })
    }

    /// Node gas price plus priority fee, capped at the max fee when the cap
    /// is non-zero.
    async fn legacy_gas_price(&self, rpc: &dyn EthRpc) -> Result<u128, RpcFault> {
        let mut gas_price = rpc.gas_price().await?.saturating_add(self.prio_fee);
        if self.max_fee > 0 {
            gas_price = gas_price.min(self.max_fee);
        }
        Ok(gas_price)
    }
}
