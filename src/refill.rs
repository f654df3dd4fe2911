//! Vault refill and overflow control.
//!
//! Once per tick (wallet ready, refill configured) the controller compares
//! the wallet's *effective* balance — token balance minus the outstanding
//! reward liability minus everything already queued — against the configured
//! band, and issues a vault transaction through the same nonce stream the
//! payout pipeline uses:
//!
//! - below `trigger_balance`  → call `withdraw_fn` on the vault
//! - above `overflow_balance` → send the excess back, with `deposit_fn`
//!   calldata when configured
//!
//! The vault ABI is supplied as configuration, so calls are encoded through
//! the dynamic ABI machinery rather than compile-time bindings. Argument
//! templates substitute `{walletAddr}`, `{amount}` and `{token}` before
//! coercion to the ABI input types.

use alloy::dyn_abi::{DynSolType, DynSolValue, FunctionExt, JsonAbiExt, Specifier};
use alloy::json_abi::{Function, JsonAbi};
use alloy::primitives::{Address, Bytes, U256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RefillConfig;
use crate::error::{PayoutError, RpcFault};
use crate::rpc::{poll_receipt, BlockTag, EthRpc};
use crate::services::FaucetServices;
use crate::tx::TxSpec;
use crate::wallet::WalletManager;

/// Minimum spacing between refill attempts, successful or not.
const RETRY_WINDOW: Duration = Duration::from_secs(60);

enum RefillAction {
    Refill,
    Overflow(U256),
}

/// Keeps the faucet wallet inside its configured balance band.
pub struct RefillController {
    config: RefillConfig,
    rpc: Arc<dyn EthRpc>,
    wallet: Arc<WalletManager>,
    services: Arc<FaucetServices>,
    refilling: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
    last_refill: Mutex<Option<Instant>>,
}

impl RefillController {
    pub fn new(
        config: RefillConfig,
        rpc: Arc<dyn EthRpc>,
        wallet: Arc<WalletManager>,
        services: Arc<FaucetServices>,
    ) -> Self {
        Self {
            config,
            rpc,
            wallet,
            services,
            refilling: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
            last_refill: Mutex::new(None),
        }
    }

    /// Seconds until the refill cooldown expires; 0 when idle.
    pub fn cooldown_remaining(&self) -> u64 {
        match *self.last_refill.lock().unwrap() {
            Some(at) => {
                let elapsed = at.elapsed();
                let cooldown = self.config.cooldown();
                cooldown.saturating_sub(elapsed).as_secs()
            }
            None => 0,
        }
    }

    /// Examine the balance band and issue a vault transaction when needed.
    ///
    /// Failures are logged at warn and retried no sooner than the retry
    /// window; the in-progress guard clears on every exit path.
    pub async fn try_refill(&self, queued_amount: U256) {
        if self.refilling.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.run_attempt(queued_amount).await {
            tracing::warn!(error = %e, "wallet refill attempt failed");
        }
        self.refilling.store(false, Ordering::SeqCst);
    }

    async fn run_attempt(&self, queued_amount: U256) -> Result<(), PayoutError> {
        {
            let last_attempt = self.last_attempt.lock().unwrap();
            if let Some(at) = *last_attempt {
                if at.elapsed() < RETRY_WINDOW {
                    return Ok(());
                }
            }
        }
        {
            let last_refill = self.last_refill.lock().unwrap();
            if let Some(at) = *last_refill {
                if at.elapsed() < self.config.cooldown() {
                    return Ok(());
                }
            }
        }

        let state = self.wallet.state();
        let unclaimed = self.services.rewards.unclaimed_liability().await;
        let effective = state
            .token_balance
            .saturating_sub(unclaimed)
            .saturating_sub(queued_amount);

        let action = match self.config.overflow_balance {
            Some(overflow) if effective > overflow => RefillAction::Overflow(effective - overflow),
            _ if effective < self.config.trigger_balance => RefillAction::Refill,
            _ => return Ok(()),
        };

        *self.last_attempt.lock().unwrap() = Some(Instant::now());

        let result = match action {
            RefillAction::Refill => {
                tracing::info!(
                    effective = %effective,
                    trigger = %self.config.trigger_balance,
                    "refilling wallet from vault"
                );
                self.refill().await
            }
            RefillAction::Overflow(amount) => {
                tracing::info!(
                    effective = %effective,
                    amount = %amount,
                    "returning overflow to vault"
                );
                self.overflow(amount).await
            }
        };

        // Reconcile regardless of outcome: the attempt may have moved funds
        // or burned a nonce before failing.
        let _ = self.wallet.load_state().await;

        if result.is_ok() {
            *self.last_refill.lock().unwrap() = Some(Instant::now());
        }
        result
    }

    /// Withdraw `request_amount` (capped by allowance and vault balance)
    /// from the vault.
    async fn refill(&self) -> Result<(), PayoutError> {
        let abi = self.parse_abi()?;
        let mut amount = self.config.request_amount;

        if let Some(allowance_fn) = &self.config.allowance_fn {
            let allowance = self
                .call_view(&abi, allowance_fn, &self.config.allowance_fn_args, amount)
                .await?;
            if allowance.is_zero() {
                return Err(PayoutError::RefillFailed(
                    "vault allowance is exhausted".to_string(),
                ));
            }
            amount = amount.min(allowance);
        }

        if let Some(target) = self.config.check_contract_balance.target(self.config.contract) {
            let balance = self.rpc.native_balance(target, BlockTag::Latest).await?;
            if balance <= self.config.contract_dust_balance {
                return Err(PayoutError::RefillFailed(format!(
                    "vault source {target} holds only dust ({balance})"
                )));
            }
            amount = amount.min(balance);
        }

        let data = encode_call(
            &abi,
            &self.config.withdraw_fn,
            &self.config.withdraw_fn_args,
            &self.placeholders(amount),
        )?;
        self.submit_vault_tx(U256::ZERO, data).await
    }

    /// Deposit `amount` native back into the vault.
    async fn overflow(&self, amount: U256) -> Result<(), PayoutError> {
        let data = match &self.config.deposit_fn {
            Some(deposit_fn) => {
                let abi = self.parse_abi()?;
                encode_call(
                    &abi,
                    deposit_fn,
                    &self.config.deposit_fn_args,
                    &self.placeholders(amount),
                )?
            }
            None => Bytes::new(),
        };
        self.submit_vault_tx(amount, data).await
    }

    /// Sign at the current nonce, submit, advance the nonce, and see the
    /// transaction through to its receipt.
    async fn submit_vault_tx(&self, value: U256, data: Bytes) -> Result<(), PayoutError> {
        let nonce = self.wallet.current_nonce();
        let signed = self
            .wallet
            .sign(TxSpec {
                to: self.config.contract,
                value,
                nonce,
                data,
                gas_limit: Some(self.config.withdraw_gas_limit),
            })
            .await?;
        let submitted = self.rpc.send_raw_transaction(signed.raw).await?;
        self.wallet.advance_nonce();
        tracing::info!(hash = %submitted.hash, nonce, "vault transaction submitted");

        let receipt = match submitted.receipt.await {
            Err(RpcFault::ReceiptTimeout) => {
                tracing::info!(hash = %submitted.hash, "vault receipt timed out, polling");
                poll_receipt(self.rpc.as_ref(), submitted.hash).await?
            }
            other => other?,
        };

        if !receipt.success {
            return Err(PayoutError::RefillFailed(format!(
                "vault transaction reverted: {receipt:?}"
            )));
        }
        tracing::info!(hash = %receipt.tx_hash, block = receipt.block, "vault transaction confirmed");
        Ok(())
    }

    fn parse_abi(&self) -> Result<JsonAbi, PayoutError> {
        serde_json::from_str(&self.config.abi)
            .map_err(|e| PayoutError::RefillConfig(format!("vault abi is not valid json abi: {e}")))
    }

    /// View call returning a single uint (the allowance pattern).
    async fn call_view(
        &self,
        abi: &JsonAbi,
        name: &str,
        args: &[String],
        amount: U256,
    ) -> Result<U256, PayoutError> {
        let data = encode_call(abi, name, args, &self.placeholders(amount))?;
        let output = self.rpc.call(self.config.contract, data).await?;
        let function = lookup_function(abi, name)?;
        let values = function
            .abi_decode_output(&output)
            .map_err(|e| PayoutError::RefillConfig(format!("{name} output decode failed: {e}")))?;
        match values.first() {
            Some(DynSolValue::Uint(value, _)) => Ok(*value),
            _ => Err(PayoutError::RefillConfig(format!(
                "{name} must return a uint"
            ))),
        }
    }

    fn placeholders(&self, amount: U256) -> Placeholders {
        Placeholders {
            wallet: self.wallet.address(),
            amount,
            token: self.wallet.token_address().unwrap_or(Address::ZERO),
        }
    }
}

struct Placeholders {
    wallet: Address,
    amount: U256,
    token: Address,
}

impl Placeholders {
    fn substitute(&self, template: &str) -> String {
        template
            .replace("{walletAddr}", &self.wallet.to_string())
            .replace("{amount}", &self.amount.to_string())
            .replace("{token}", &self.token.to_string())
    }
}

fn lookup_function<'a>(abi: &'a JsonAbi, name: &str) -> Result<&'a Function, PayoutError> {
    abi.function(name)
        .and_then(|overloads| overloads.first())
        .ok_or_else(|| PayoutError::RefillConfig(format!("function {name} not found in vault abi")))
}

/// Encode a call to `name` with the templated arguments coerced to the ABI
/// input types.
fn encode_call(
    abi: &JsonAbi,
    name: &str,
    args: &[String],
    placeholders: &Placeholders,
) -> Result<Bytes, PayoutError> {
    let function = lookup_function(abi, name)?;
    if function.inputs.len() != args.len() {
        return Err(PayoutError::RefillConfig(format!(
            "{name} expects {} arguments, {} configured",
            function.inputs.len(),
            args.len()
        )));
    }

    let mut values = Vec::with_capacity(args.len());
    for (input, template) in function.inputs.iter().zip(args) {
        let rendered = placeholders.substitute(template);
        let ty: DynSolType = input
            .resolve()
            .map_err(|e| PayoutError::RefillConfig(format!("{name}: bad input type: {e}")))?;
        let value = ty.coerce_str(&rendered).map_err(|e| {
            PayoutError::RefillConfig(format!("{name}: argument {rendered:?} not a {ty}: {e}"))
        })?;
        values.push(value);
    }

    function
        .abi_encode_input(&values)
        .map(Bytes::from)
        .map_err(|e| PayoutError::RefillConfig(format!("{name} encode failed: {e}")))
}
