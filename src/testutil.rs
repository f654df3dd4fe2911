//! Scriptable test doubles for the RPC seam.

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::RpcFault;
use crate::rpc::{BlockTag, EthRpc, PayoutReceipt, SubmittedTx};

/// How a scripted submission resolves its receipt future.
pub enum ReceiptScript {
    /// Receipt resolves immediately.
    Mined {
        block: u64,
        gas_used: u64,
        effective_gas_price: u128,
        success: bool,
    },
    /// Receipt future errors with [`RpcFault::ReceiptTimeout`], pushing the
    /// caller into the poll loop.
    Timeout,
    /// Receipt future never resolves; the transaction stays in flight.
    Never,
    Fail(RpcFault),
}

/// Outcome of one `send_raw_transaction` call.
pub enum SendOutcome {
    Accept(ReceiptScript),
    Reject(RpcFault),
}

/// A raw transaction the mock accepted.
#[derive(Debug, Clone)]
pub struct SentTx {
    pub raw: Vec<u8>,
    pub hash: B256,
}

/// Scriptable [`EthRpc`] implementation.
///
/// Reads return configured values; submissions and receipt polls pop
/// per-call scripts (falling back to a successful default when the script
/// runs dry).
#[derive(Default)]
pub struct MockRpc {
    native_balance: Mutex<U256>,
    balances: Mutex<HashMap<Address, U256>>,
    nonce: Mutex<u64>,
    chain_id: Mutex<u64>,
    gas_price: Mutex<u128>,
    gas_price_queries: AtomicUsize,
    reject_pending: AtomicBool,
    read_fault: Mutex<Option<String>>,
    code: Mutex<HashMap<Address, String>>,
    send_script: Mutex<VecDeque<SendOutcome>>,
    sent: Mutex<Vec<SentTx>>,
    receipt_polls: Mutex<VecDeque<Result<Option<PayoutReceipt>, RpcFault>>>,
    receipt_poll_count: AtomicUsize,
    token_balance: Mutex<U256>,
    token_decimals: Mutex<u8>,
    token_decimals_queries: AtomicUsize,
    call_results: Mutex<VecDeque<Result<Bytes, RpcFault>>>,
    calls: Mutex<Vec<(Address, Bytes)>>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self {
            chain_id: Mutex::new(1337),
            gas_price: Mutex::new(1_000_000_000),
            token_decimals: Mutex::new(18),
            ..Self::default()
        }
    }

    pub fn set_native_balance(&self, value: U256) {
        *self.native_balance.lock().unwrap() = value;
    }

    pub fn set_balance_of(&self, addr: Address, value: U256) {
        self.balances.lock().unwrap().insert(addr, value);
    }

    pub fn set_nonce(&self, nonce: u64) {
        *self.nonce.lock().unwrap() = nonce;
    }

    pub fn set_gas_price(&self, price: u128) {
        *self.gas_price.lock().unwrap() = price;
    }

    pub fn gas_price_queries(&self) -> usize {
        self.gas_price_queries.load(Ordering::SeqCst)
    }

    /// Make `pending`-tagged reads fail the way unsupporting nodes do.
    pub fn reject_pending_tag(&self) {
        self.reject_pending.store(true, Ordering::SeqCst);
    }

    /// Make every state read fail with a connection fault.
    pub fn fail_reads(&self, message: &str) {
        *self.read_fault.lock().unwrap() = Some(message.to_string());
    }

    pub fn restore_reads(&self) {
        *self.read_fault.lock().unwrap() = None;
    }

    pub fn set_code(&self, addr: Address, code: &str) {
        self.code.lock().unwrap().insert(addr, code.to_string());
    }

    pub fn push_send(&self, outcome: SendOutcome) {
        self.send_script.lock().unwrap().push_back(outcome);
    }

    /// Raw transactions accepted so far, in submission order.
    pub fn sent(&self) -> Vec<SentTx> {
        self.sent.lock().unwrap().clone()
    }

    pub fn push_receipt_poll(&self, result: Result<Option<PayoutReceipt>, RpcFault>) {
        self.receipt_polls.lock().unwrap().push_back(result);
    }

    pub fn receipt_poll_count(&self) -> usize {
        self.receipt_poll_count.load(Ordering::SeqCst)
    }

    pub fn set_token_balance(&self, value: U256) {
        *self.token_balance.lock().unwrap() = value;
    }

    pub fn set_token_decimals(&self, decimals: u8) {
        *self.token_decimals.lock().unwrap() = decimals;
    }

    pub fn token_decimals_queries(&self) -> usize {
        self.token_decimals_queries.load(Ordering::SeqCst)
    }

    pub fn push_call_result(&self, result: Result<Bytes, RpcFault>) {
        self.call_results.lock().unwrap().push_back(result);
    }

    /// `eth_call` invocations observed so far.
    pub fn calls(&self) -> Vec<(Address, Bytes)> {
        self.calls.lock().unwrap().clone()
    }

    fn read_guard(&self) -> Result<(), RpcFault> {
        match self.read_fault.lock().unwrap().as_ref() {
            Some(message) => Err(RpcFault::Connection(message.clone())),
            None => Ok(()),
        }
    }

    fn pending_guard(&self, tag: BlockTag) -> Result<(), RpcFault> {
        if tag == BlockTag::Pending && self.reject_pending.load(Ordering::SeqCst) {
            return Err(RpcFault::Call(
                "Internal error: \"pending\" is not yet supported".to_string(),
            ));
        }
        Ok(())
    }
}

/// A successful receipt with placeholder hash, for poll scripts.
pub fn mined_receipt(block: u64, gas_used: u64, effective_gas_price: u128) -> PayoutReceipt {
    PayoutReceipt {
        tx_hash: B256::ZERO,
        block,
        gas_used,
        effective_gas_price,
        success: true,
    }
}

#[async_trait]
impl EthRpc for MockRpc {
    async fn native_balance(&self, addr: Address, tag: BlockTag) -> Result<U256, RpcFault> {
        self.read_guard()?;
        self.pending_guard(tag)?;
        if let Some(balance) = self.balances.lock().unwrap().get(&addr) {
            return Ok(*balance);
        }
        Ok(*self.native_balance.lock().unwrap())
    }

    async fn transaction_count(&self, _addr: Address, tag: BlockTag) -> Result<u64, RpcFault> {
        self.read_guard()?;
        self.pending_guard(tag)?;
        Ok(*self.nonce.lock().unwrap())
    }

    async fn chain_id(&self) -> Result<u64, RpcFault> {
        self.read_guard()?;
        Ok(*self.chain_id.lock().unwrap())
    }

    async fn gas_price(&self) -> Result<u128, RpcFault> {
        self.gas_price_queries.fetch_add(1, Ordering::SeqCst);
        Ok(*self.gas_price.lock().unwrap())
    }

    async fn code_at(&self, addr: Address) -> Result<String, RpcFault> {
        Ok(self
            .code
            .lock()
            .unwrap()
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| "0x".to_string()))
    }

    async fn transaction_receipt(&self, _hash: B256) -> Result<Option<PayoutReceipt>, RpcFault> {
        self.receipt_poll_count.fetch_add(1, Ordering::SeqCst);
        self.receipt_polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(None))
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<SubmittedTx, RpcFault> {
        let outcome = self
            .send_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendOutcome::Accept(ReceiptScript::Mined {
                block: 1,
                gas_used: 21_000,
                effective_gas_price: 1_000_000_000,
                success: true,
            }));

        let script = match outcome {
            SendOutcome::Reject(fault) => return Err(fault),
            SendOutcome::Accept(script) => script,
        };

        let hash = keccak256(&raw);
        self.sent.lock().unwrap().push(SentTx {
            raw,
            hash,
        });

        let receipt = match script {
            ReceiptScript::Mined {
                block,
                gas_used,
                effective_gas_price,
                success,
            } => async move {
                Ok(PayoutReceipt {
                    tx_hash: hash,
                    block,
                    gas_used,
                    effective_gas_price,
                    success,
                })
            }
            .boxed(),
            ReceiptScript::Timeout => async { Err(RpcFault::ReceiptTimeout) }.boxed(),
            ReceiptScript::Never => futures::future::pending().boxed(),
            ReceiptScript::Fail(fault) => async move { Err(fault) }.boxed(),
        };

        Ok(SubmittedTx { hash, receipt })
    }

    async fn token_balance(&self, _token: Address, _owner: Address) -> Result<U256, RpcFault> {
        self.read_guard()?;
        Ok(*self.token_balance.lock().unwrap())
    }

    async fn token_decimals(&self, _token: Address) -> Result<u8, RpcFault> {
        self.token_decimals_queries.fetch_add(1, Ordering::SeqCst);
        Ok(*self.token_decimals.lock().unwrap())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcFault> {
        self.calls.lock().unwrap().push((to, data));
        self.call_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Bytes::new()))
    }
}
