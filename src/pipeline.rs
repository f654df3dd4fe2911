//! The claim pipeline: queue, bounded in-flight map, history, and the tick
//! loop that drives them.
//!
//! One tick (2 s cadence, non-reentrant) drains the queue up to the in-flight
//! cap, processing claims strictly sequentially — the wallet is a serial
//! signer, and the nonce stream is owned by whoever is inside the tick.
//! Receipt tracking is detached per transaction: the watcher holds only the
//! hash and the receipt future, so it survives provider rebuilds and never
//! blocks the queue.
//!
//! Shared state lives behind one mutex that is never held across an await;
//! the re-entrancy flag serializes ticks the same way the cooperative
//! scheduler of the original service did.

use alloy::primitives::{Address, B256, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

use crate::claim::{parse_claim_target, ClaimStatus, ClaimTx};
use crate::config::FaucetConfig;
use crate::error::{PayoutError, RpcFault};
use crate::refill::RefillController;
use crate::rpc::{erc20_transfer_calldata, poll_receipt, BlockTag, EthRpc, ReceiptFuture};
use crate::services::FaucetServices;
use crate::tx::TxSpec;
use crate::wallet::WalletManager;

/// Tick cadence of the pipeline.
pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Submission attempts per claim before it fails.
const SUBMIT_ATTEMPTS: u32 = 4;

/// Pause between submission attempts, ahead of the reconciliation.
const SUBMIT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// How long terminal claims stay findable by session id.
const HISTORY_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Idle reconciliation cadence while the wallet is healthy.
const REFRESH_INTERVAL_READY: Duration = Duration::from_secs(600);

/// Reconciliation cadence while the wallet is offline.
const REFRESH_INTERVAL_OFFLINE: Duration = Duration::from_secs(10);

#[derive(Default)]
struct PipelineState {
    queue: VecDeque<Arc<ClaimTx>>,
    pending: HashMap<B256, Arc<ClaimTx>>,
    history: HashMap<u64, Arc<ClaimTx>>,
    claim_counter: u64,
    last_processed_idx: u64,
}

/// The payout orchestrator.
pub struct ClaimPipeline {
    config: Arc<FaucetConfig>,
    rpc: Arc<dyn EthRpc>,
    wallet: Arc<WalletManager>,
    services: Arc<FaucetServices>,
    refill: Option<RefillController>,
    state: Mutex<PipelineState>,
    tick_running: AtomicBool,
}

impl ClaimPipeline {
    pub fn new(
        config: Arc<FaucetConfig>,
        rpc: Arc<dyn EthRpc>,
        wallet: Arc<WalletManager>,
        services: Arc<FaucetServices>,
    ) -> Arc<Self> {
        let refill = config.refill.clone().map(|refill_config| {
            RefillController::new(
                refill_config,
                Arc::clone(&rpc),
                Arc::clone(&wallet),
                Arc::clone(&services),
            )
        });
        Arc::new(Self {
            config,
            rpc,
            wallet,
            services,
            refill,
            state: Mutex::new(PipelineState::default()),
            tick_running: AtomicBool::new(false),
        })
    }

    /// The wallet this pipeline signs from.
    pub fn wallet(&self) -> &Arc<WalletManager> {
        &self.wallet
    }

    /// Rebuild the queue from durable storage. Restored order defines the
    /// `queue_idx` assignment.
    pub fn restore(&self) {
        let stored = self.services.store.load_claim_queue();
        let restored = stored.len();
        let mut state = self.state.lock().unwrap();
        for entry in stored {
            state.claim_counter += 1;
            let claim = Arc::new(ClaimTx::restored(state.claim_counter, entry));
            state.queue.push_back(claim);
        }
        if restored > 0 {
            tracing::info!(restored, "claim queue restored from storage");
        }
    }

    /// Run the tick loop forever. Spawn this once after [`restore`].
    ///
    /// [`restore`]: Self::restore
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(TICK_INTERVAL);
        ticker.tick().await; // First tick completes immediately
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Invalidate the wallet refresh timestamp whenever the provider reload
    /// generation bumps, forcing the next idle tick to reconcile.
    pub fn watch_reloads(self: &Arc<Self>, mut reloads: watch::Receiver<u64>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while reloads.changed().await.is_ok() {
                tracing::info!("provider reloaded, forcing wallet reconciliation");
                this.wallet.invalidate_refresh();
            }
        });
    }

    /// Enqueue a payout request.
    ///
    /// Rejects a session id that already exists anywhere in the pipeline.
    /// The claim is written to durable storage before this returns.
    pub fn add_claim_transaction(
        &self,
        target: &str,
        amount: U256,
        session: &str,
    ) -> Result<Arc<ClaimTx>, PayoutError> {
        let target = parse_claim_target(target)?;
        let claim = {
            let mut state = self.state.lock().unwrap();
            if find_session(&state, session).is_some() {
                return Err(PayoutError::DuplicateSession(session.to_string()));
            }
            state.claim_counter += 1;
            let claim = Arc::new(ClaimTx::new(
                state.claim_counter,
                target,
                amount,
                session.to_string(),
            ));
            state.queue.push_back(Arc::clone(&claim));
            claim
        };
        self.services.store.add_queued_claim(&claim.to_stored());
        tracing::info!(
            session,
            queue_idx = claim.queue_idx,
            target = %claim.target,
            amount = %claim.amount,
            "claim queued"
        );
        Ok(claim)
    }

    /// Find a claim by session id: queue first, then pending, then history.
    pub fn get_claim_transaction(&self, session: &str) -> Option<Arc<ClaimTx>> {
        find_session(&self.state.lock().unwrap(), session)
    }

    /// One pipeline tick. Re-entrant calls (a tick still running from the
    /// previous interval) return immediately.
    pub async fn tick(self: &Arc<Self>) {
        if self
            .tick_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.run_tick().await;
        self.tick_running.store(false, Ordering::SeqCst);
    }

    async fn run_tick(self: &Arc<Self>) {
        loop {
            let head = {
                let mut state = self.state.lock().unwrap();
                if state.pending.len() >= self.config.max_pending {
                    break;
                }
                let Some(head) = state.queue.front().cloned() else {
                    break;
                };
                if self.config.queue_no_funds && !self.can_cover(head.amount) {
                    break;
                }
                state.queue.pop_front();
                state.last_processed_idx = head.queue_idx;
                head
            };
            self.process(head).await;
        }

        let idle = self.state.lock().unwrap().pending.is_empty();
        if idle {
            let threshold = if self.wallet.is_ready() {
                REFRESH_INTERVAL_READY
            } else {
                REFRESH_INTERVAL_OFFLINE
            };
            let stale = self
                .wallet
                .refresh_age()
                .map_or(true, |age| age > threshold);
            if stale {
                let _ = self.wallet.load_state().await;
            }
        }

        if let Some(refill) = &self.refill {
            if self.wallet.is_ready() {
                refill.try_refill(self.queued_amount()).await;
            }
        }
    }

    /// The wallet can pay this claim: gas reserve intact and the token
    /// balance (minus the spare-funds floor) covers the amount.
    fn can_cover(&self, amount: U256) -> bool {
        let state = self.wallet.state();
        if state.native_balance <= self.config.gas_reserve() {
            return false;
        }
        state
            .token_balance
            .saturating_sub(self.config.spare_funds_amount)
            >= amount
    }

    async fn process(self: &Arc<Self>, claim: Arc<ClaimTx>) {
        if !self.wallet.is_ready() || !self.can_cover(claim.amount) {
            tracing::warn!(
                session = %claim.session,
                amount = %claim.amount,
                "claim rejected, faucet cannot cover payout"
            );
            claim.fail("faucet wallet cannot cover the payout");
            self.services.store.remove_queued_claim(&claim.session);
            return;
        }

        claim.set_status(ClaimStatus::Processing);

        let mut first_error: Option<String> = None;
        let mut attempted_nonce = None;
        let mut submitted = None;
        for attempt in 0..SUBMIT_ATTEMPTS {
            if attempt > 0 {
                claim.record_retry();
                tokio::time::sleep(SUBMIT_RETRY_DELAY).await;
                // Pick up the node's authoritative nonce before rebuilding.
                let _ = self.wallet.load_state().await;
            }
            let nonce = self.wallet.current_nonce();
            let signed = match self.wallet.sign(self.claim_spec(&claim, nonce)).await {
                Ok(signed) => signed,
                Err(e) => {
                    tracing::warn!(session = %claim.session, attempt, error = %e, "claim build failed");
                    first_error.get_or_insert_with(|| e.to_string());
                    continue;
                }
            };
            attempted_nonce = Some(nonce);
            match self.rpc.send_raw_transaction(signed.raw.clone()).await {
                Ok(tx) => {
                    submitted = Some((nonce, signed, tx));
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        session = %claim.session,
                        attempt,
                        nonce,
                        error = %e,
                        "claim submission rejected"
                    );
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        let Some((nonce, signed, tx)) = submitted else {
            // The claim failed after attempting submission: keep the nonce
            // it last signed with on the record.
            if let Some(nonce) = attempted_nonce {
                claim.record_attempted_nonce(nonce);
            }
            let reason =
                first_error.unwrap_or_else(|| "transaction submission failed".to_string());
            claim.fail(reason);
            self.services.store.remove_queued_claim(&claim.session);
            return;
        };

        claim.record_submission(nonce, signed.hex, tx.hash);
        self.wallet.note_submitted(claim.amount).await;
        self.state
            .lock()
            .unwrap()
            .pending
            .insert(tx.hash, Arc::clone(&claim));
        self.services.store.remove_queued_claim(&claim.session);
        claim.set_status(ClaimStatus::Pending);
        tracing::info!(
            session = %claim.session,
            nonce,
            hash = %tx.hash,
            "claim submitted"
        );

        let this = Arc::clone(self);
        let hash = tx.hash;
        let receipt = tx.receipt;
        tokio::spawn(async move {
            this.watch_receipt(claim, hash, receipt).await;
        });
    }

    /// Transaction shape for a claim: token mode routes a `transfer` through
    /// the token contract, native mode pays the target directly.
    fn claim_spec(&self, claim: &ClaimTx, nonce: u64) -> TxSpec {
        match self.wallet.token_address() {
            Some(token) => TxSpec {
                to: token,
                value: U256::ZERO,
                nonce,
                data: erc20_transfer_calldata(claim.target, claim.amount),
                gas_limit: None,
            },
            None => TxSpec {
                to: claim.target,
                value: claim.amount,
                nonce,
                data: Default::default(),
                gas_limit: None,
            },
        }
    }

    async fn watch_receipt(
        self: Arc<Self>,
        claim: Arc<ClaimTx>,
        hash: B256,
        receipt: ReceiptFuture,
    ) {
        let result = match receipt.await {
            Err(RpcFault::ReceiptTimeout) => {
                tracing::info!(%hash, "receipt watcher timed out, switching to polling");
                poll_receipt(self.rpc.as_ref(), hash).await
            }
            other => other,
        };

        self.state.lock().unwrap().pending.remove(&hash);

        match result {
            Ok(receipt) => {
                let fee = receipt.fee();
                claim.record_receipt(receipt.block, fee);
                self.wallet.note_fee(fee).await;
                if receipt.success {
                    claim.set_status(ClaimStatus::Confirmed);
                    self.services.stats.record_claim(&claim);
                    tracing::info!(
                        session = %claim.session,
                        %hash,
                        block = receipt.block,
                        fee = %fee,
                        "claim confirmed"
                    );
                } else {
                    claim.fail(format!("transaction reverted on-chain: {receipt:?}"));
                    tracing::warn!(session = %claim.session, %hash, "claim transaction reverted");
                }
            }
            Err(e) => {
                claim.fail(format!("receipt retrieval failed: {e}"));
                tracing::warn!(session = %claim.session, %hash, error = %e, "claim failed");
            }
        }

        self.archive(claim);
    }

    /// Park a terminal claim in history, findable by session id for the
    /// retention window. Keyed by `queue_idx`, which is unique per claim —
    /// nonces are not, after a node reset.
    fn archive(self: &Arc<Self>, claim: Arc<ClaimTx>) {
        let idx = claim.queue_idx;
        self.state.lock().unwrap().history.insert(idx, claim);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(HISTORY_RETENTION).await;
            this.state.lock().unwrap().history.remove(&idx);
        });
    }

    // ── Exposed surface ──────────────────────────────────────────────

    /// All claims the pipeline knows about, queue first in order, then
    /// pending and history sorted by `queue_idx`. `queue_only` restricts to
    /// the waiting queue.
    pub fn transaction_queue(&self, queue_only: bool) -> Vec<Arc<ClaimTx>> {
        let state = self.state.lock().unwrap();
        let mut claims: Vec<_> = state.queue.iter().cloned().collect();
        if !queue_only {
            let mut rest: Vec<_> = state
                .pending
                .values()
                .chain(state.history.values())
                .cloned()
                .collect();
            rest.sort_by_key(|c| c.queue_idx);
            claims.extend(rest);
        }
        claims
    }

    pub fn faucet_address(&self) -> Address {
        self.wallet.address()
    }

    pub async fn faucet_decimals(&self, native: bool) -> Result<u8, RpcFault> {
        self.wallet.decimals(native).await
    }

    pub async fn readable_amount(&self, amount: U256, native: bool) -> Result<String, RpcFault> {
        self.wallet.readable_amount(amount, native).await
    }

    /// Native balance of an arbitrary address, read from the node.
    pub async fn wallet_balance(&self, addr: Address) -> Result<U256, RpcFault> {
        self.rpc.native_balance(addr, BlockTag::Latest).await
    }

    /// True iff the address carries deployed bytecode.
    pub async fn check_is_contract(&self, addr: Address) -> Result<bool, RpcFault> {
        let code = self.rpc.code_at(addr).await?;
        Ok(is_contract_code(&code))
    }

    /// Cached faucet balance in the requested denomination.
    pub fn faucet_balance(&self, native: bool) -> U256 {
        let state = self.wallet.state();
        if native {
            state.native_balance
        } else {
            state.token_balance
        }
    }

    /// Total amount waiting in the queue.
    pub fn queued_amount(&self) -> U256 {
        self.state
            .lock()
            .unwrap()
            .queue
            .iter()
            .fold(U256::ZERO, |acc, c| acc + c.amount)
    }

    pub fn last_processed_claim_idx(&self) -> u64 {
        self.state.lock().unwrap().last_processed_idx
    }

    /// Seconds until the refill cooldown expires; 0 when unused or elapsed.
    pub fn refill_cooldown(&self) -> u64 {
        self.refill
            .as_ref()
            .map_or(0, |refill| refill.cooldown_remaining())
    }
}

fn find_session(state: &PipelineState, session: &str) -> Option<Arc<ClaimTx>> {
    state
        .queue
        .iter()
        .find(|c| c.session == session)
        .or_else(|| state.pending.values().find(|c| c.session == session))
        .or_else(|| state.history.values().find(|c| c.session == session))
        .cloned()
}

/// A `getCode` result that denotes a real contract: `0x` followed by at
/// least two lowercase hex digits.
fn is_contract_code(code: &str) -> bool {
    match code.strip_prefix("0x") {
        Some(rest) => {
            rest.len() >= 2
                && rest
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}
