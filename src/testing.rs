//! Scriptable in-memory chain used by the sender tests

use crate::chain::{BlockHeader, BlockTag, CallMsg, ChainClient, TxReceipt};
use crate::config::{Confirmations, SenderConfig, SignerConfig};
use crate::error::{SenderError, SenderResult};
use crate::tx::SignedTx;
use crate::types::TxType;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const TEST_PRIVATE_KEY: &str =
    "1212121212121212121212121212121212121212121212121212121212121212";

pub const GWEI: u64 = 1_000_000_000;

pub struct FakeChainState {
    pub chain_id: u64,
    pub head: u64,
    pub base_fee: Option<U256>,
    pub gas_price: U256,
    pub gas_tip_cap: U256,
    /// `None` makes every dry-run fail
    pub estimate: Option<u64>,
    /// The node's view of the next nonce
    pub pending_nonce: u64,
    /// Errors returned by the next broadcasts, in order
    pub broadcast_errors: VecDeque<String>,
    pub sent: Vec<SignedTx>,
    pub receipts: HashMap<H256, TxReceipt>,
}

pub struct FakeChain {
    state: Mutex<FakeChainState>,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeChainState {
                chain_id: 1337,
                head: 100,
                base_fee: Some(U256::from(GWEI)),
                gas_price: U256::from(GWEI),
                gas_tip_cap: U256::from(GWEI),
                estimate: Some(21_000),
                pending_nonce: 0,
                broadcast_errors: VecDeque::new(),
                sent: Vec::new(),
                receipts: HashMap::new(),
            }),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeChainState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Include `hash` in the current head block
    pub fn mine(&self, hash: H256, status: bool) {
        self.with(|s| {
            let block_number = s.head;
            s.receipts.insert(
                hash,
                TxReceipt {
                    block_number,
                    status,
                },
            );
        });
    }

    pub fn advance(&self, blocks: u64) {
        self.with(|s| s.head += blocks);
    }

    pub fn sent(&self) -> Vec<SignedTx> {
        self.with(|s| s.sent.clone())
    }

    pub fn last_sent(&self) -> SignedTx {
        self.with(|s| s.sent.last().cloned().unwrap())
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn chain_id(&self) -> SenderResult<u64> {
        Ok(self.with(|s| s.chain_id))
    }

    async fn pending_nonce_at(&self, _address: Address) -> SenderResult<u64> {
        Ok(self.with(|s| s.pending_nonce))
    }

    async fn suggest_gas_price(&self) -> SenderResult<U256> {
        Ok(self.with(|s| s.gas_price))
    }

    async fn suggest_gas_tip_cap(&self) -> SenderResult<U256> {
        Ok(self.with(|s| s.gas_tip_cap))
    }

    async fn estimate_gas(&self, _msg: &CallMsg) -> SenderResult<u64> {
        self.with(|s| s.estimate)
            .ok_or_else(|| SenderError::GasEstimation("execution reverted".to_string()))
    }

    async fn header_by_number(&self, tag: BlockTag) -> SenderResult<BlockHeader> {
        self.with(|s| {
            let number = match tag {
                BlockTag::Number(n) => n,
                _ => s.head,
            };
            Ok(BlockHeader {
                number,
                base_fee_per_gas: s.base_fee,
            })
        })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> SenderResult<H256> {
        let signed = SignedTx::decode(&raw)?;
        self.with(|s| {
            if let Some(message) = s.broadcast_errors.pop_front() {
                return Err(SenderError::Broadcast(message));
            }
            s.pending_nonce = s.pending_nonce.max(signed.nonce() + 1);
            let hash = signed.hash;
            s.sent.push(signed);
            Ok(hash)
        })
    }

    async fn transaction_receipt(&self, hash: H256) -> SenderResult<Option<TxReceipt>> {
        Ok(self.with(|s| s.receipts.get(&hash).copied()))
    }
}

pub fn sender_config(tx_type: TxType) -> SenderConfig {
    SenderConfig {
        endpoint: "http://localhost:8545".to_string(),
        check_pending_time_secs: 3600,
        escalate_blocks: 10,
        confirmations: Confirmations::Latest,
        escalate_multiple_num: 11,
        escalate_multiple_den: 10,
        max_gas_price: 1_000 * GWEI,
        min_gas_tip: 0,
        tx_type,
        pending_limit: 0,
    }
}

pub fn signer_config() -> SignerConfig {
    SignerConfig::PrivateKey {
        private_key: TEST_PRIVATE_KEY.to_string(),
    }
}
