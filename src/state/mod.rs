//! Durable record of in-flight transactions
//!
//! Handles:
//! - One record per submitted or replaced transaction attempt
//! - Atomic replace (old attempt `Replaced`, successor `Pending`)
//! - Atomic confirm (winner settled, every sibling on the same nonce failed)
//! - Restart recovery: the sender loop reloads open records from here

mod manager;
mod memory;

pub use manager::PgPendingTxStore;
pub use memory::MemoryPendingTxStore;

use crate::error::SenderResult;
use crate::tx::SignedTx;
use crate::types::{SenderMeta, SenderType, TxStatus, TxType};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};

/// One submitted transaction attempt.
///
/// Records are never deleted; only `status` changes.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    /// Caller-supplied logical key, shared by every attempt of one transaction
    pub context_id: String,
    pub hash: H256,
    pub chain_id: u64,
    pub tx_type: TxType,
    pub gas_tip_cap: u64,
    pub gas_fee_cap: u64,
    pub gas_limit: u64,
    pub nonce: u64,
    /// Chain height observed at submission, basis for staleness
    pub submit_block_number: u64,
    pub status: TxStatus,
    /// Signed transaction encoding, enough to rebuild a replacement
    pub raw: Bytes,
    pub sender: SenderMeta,
    pub created_at: DateTime<Utc>,
}

impl PendingTransaction {
    /// Build the `Pending` record of a freshly broadcast transaction
    pub fn new(
        context_id: &str,
        sender: &SenderMeta,
        chain_id: u64,
        signed: &SignedTx,
        submit_block_number: u64,
    ) -> Self {
        let gas_price = signed.gas_price();
        Self {
            context_id: context_id.to_string(),
            hash: signed.hash,
            chain_id,
            tx_type: signed.tx_type(),
            gas_tip_cap: saturating_u64(gas_price.tip_cap()),
            gas_fee_cap: saturating_u64(gas_price.fee_cap()),
            gas_limit: signed.gas_limit(),
            nonce: signed.nonce(),
            submit_block_number,
            status: TxStatus::Pending,
            raw: signed.raw.clone(),
            sender: sender.clone(),
            created_at: Utc::now(),
        }
    }
}

fn saturating_u64(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}

/// Persistence boundary of the sender
#[async_trait]
pub trait PendingTxStore: Send + Sync {
    async fn insert_pending_transaction(&self, tx: &PendingTransaction) -> SenderResult<()>;

    /// Mark `old_hash` as `Replaced` and insert `successor`, both or neither
    async fn replace_pending_transaction(
        &self,
        old_hash: H256,
        successor: &PendingTransaction,
    ) -> SenderResult<()>;

    /// Settle `hash` with `status` and fail every other record of
    /// `(sender_address, nonce)`, both or neither
    async fn confirm_transaction(
        &self,
        hash: H256,
        status: TxStatus,
        sender_address: Address,
        nonce: u64,
    ) -> SenderResult<()>;

    async fn update_status_by_hash(&self, hash: H256, status: TxStatus) -> SenderResult<()>;

    async fn update_other_transactions_as_failed_by_nonce(
        &self,
        sender_address: Address,
        nonce: u64,
        exclude_hash: H256,
    ) -> SenderResult<()>;

    /// Open records of a sender type, ordered by nonce then fee cap
    async fn pending_or_replaced_by_sender_type(
        &self,
        sender_type: SenderType,
        limit: usize,
    ) -> SenderResult<Vec<PendingTransaction>>;

    /// Number of `Pending` records of a sender type
    async fn count_pending_by_sender_type(&self, sender_type: SenderType) -> SenderResult<u64>;

    async fn status_by_hash(&self, hash: H256) -> SenderResult<Option<TxStatus>>;
}
