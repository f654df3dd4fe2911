//! EVM faucet payout engine.
//!
//! This crate is the on-chain half of a faucet service: it accepts payout
//! claims (target address, amount, session id), serializes them through one
//! signing wallet, submits the signed transactions over JSON-RPC, tracks each
//! one to its receipt, and keeps the wallet solvent against a configured
//! vault contract.
//!
//! The moving parts:
//! - [`pipeline::ClaimPipeline`] — the queue, the bounded in-flight map and
//!   the 2-second tick that drives everything
//! - [`wallet::WalletManager`] — the cached wallet view (nonce, balances) and
//!   its reconciliation against the node
//! - [`refill::RefillController`] — trigger/overflow transfers against the
//!   vault
//! - [`rpc::EthRpc`] / [`rpc::EvmRpc`] — the narrow chain seam and its alloy
//!   implementation
//! - [`services::FaucetServices`] — the collaborator bundle (durable store,
//!   status surface, statistics, reward liability)
//!
//! Wiring it up:
//!
//! ```no_run
//! use std::sync::Arc;
//! use faucet_payout::rpc::EvmRpc;
//! use faucet_payout::{ClaimPipeline, FaucetConfig, FaucetServices, WalletManager};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(FaucetConfig::from_env()?);
//! let rpc = Arc::new(EvmRpc::connect(&config.rpc_host).await?);
//! let services = Arc::new(FaucetServices::default());
//! let wallet = Arc::new(WalletManager::new(
//!     config.clone(),
//!     rpc.clone(),
//!     services.status.clone(),
//! )?);
//! let pipeline = ClaimPipeline::new(config, rpc.clone(), wallet, services);
//!
//! pipeline.restore();
//! let _ = pipeline.wallet().load_state().await;
//! pipeline.watch_reloads(rpc.reload_events());
//! tokio::spawn(pipeline.clone().run());
//!
//! let claim = pipeline.add_claim_transaction(
//!     "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045",
//!     "1000000000000000000".parse()?,
//!     "session-1",
//! )?;
//! let mut events = claim.subscribe();
//! while let Ok(status) = events.recv().await {
//!     println!("claim is now {status}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod claim;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod refill;
pub mod rpc;
pub mod services;
pub mod status;
pub mod store;
pub mod tx;
pub mod wallet;

#[cfg(test)]
pub(crate) mod testutil;

pub use claim::{ClaimStatus, ClaimTx, StoredClaim};
pub use config::{CoinType, FaucetConfig, RefillConfig};
pub use error::{PayoutError, RpcFault};
pub use pipeline::ClaimPipeline;
pub use refill::RefillController;
pub use services::FaucetServices;
pub use status::{StatusSink, StatusUpdate, WalletStatus};
pub use store::ClaimStore;
pub use wallet::WalletManager;
