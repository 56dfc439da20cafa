//! In-memory pending transaction store.
//!
//! Keeps every record in a vector behind a read-write lock. Nothing survives
//! a restart, so this backs tests and local development only.

use super::{PendingTransaction, PendingTxStore};
use crate::error::{SenderError, SenderResult};
use crate::types::{SenderType, TxStatus};

use async_trait::async_trait;
use ethers::types::{Address, H256};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct MemoryPendingTxStore {
    records: Arc<RwLock<Vec<PendingTransaction>>>,
}

impl MemoryPendingTxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records in insertion order
    pub async fn records(&self) -> Vec<PendingTransaction> {
        self.records.read().await.clone()
    }

    /// Records sharing a context id, in insertion order
    pub async fn records_by_context(&self, context_id: &str) -> Vec<PendingTransaction> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.context_id == context_id)
            .cloned()
            .collect()
    }
}

fn insert_into(records: &mut Vec<PendingTransaction>, tx: &PendingTransaction) -> SenderResult<()> {
    if records.iter().any(|r| r.hash == tx.hash) {
        return Err(SenderError::Persistence(format!(
            "duplicate transaction hash {:?}",
            tx.hash
        )));
    }
    records.push(tx.clone());
    Ok(())
}

fn set_status(records: &mut [PendingTransaction], hash: H256, status: TxStatus) {
    for record in records.iter_mut().filter(|r| r.hash == hash) {
        record.status = status;
    }
}

fn fail_siblings(records: &mut [PendingTransaction], address: Address, nonce: u64, exclude: H256) {
    for record in records
        .iter_mut()
        .filter(|r| r.sender.address == address && r.nonce == nonce && r.hash != exclude)
    {
        record.status = TxStatus::ConfirmedFailed;
    }
}

#[async_trait]
impl PendingTxStore for MemoryPendingTxStore {
    async fn insert_pending_transaction(&self, tx: &PendingTransaction) -> SenderResult<()> {
        let mut records = self.records.write().await;
        insert_into(&mut records, tx)
    }

    async fn replace_pending_transaction(
        &self,
        old_hash: H256,
        successor: &PendingTransaction,
    ) -> SenderResult<()> {
        let mut records = self.records.write().await;
        // insert first: a duplicate must leave the old record untouched
        insert_into(&mut records, successor)?;
        set_status(&mut records, old_hash, TxStatus::Replaced);
        Ok(())
    }

    async fn confirm_transaction(
        &self,
        hash: H256,
        status: TxStatus,
        sender_address: Address,
        nonce: u64,
    ) -> SenderResult<()> {
        let mut records = self.records.write().await;
        set_status(&mut records, hash, status);
        fail_siblings(&mut records, sender_address, nonce, hash);
        Ok(())
    }

    async fn update_status_by_hash(&self, hash: H256, status: TxStatus) -> SenderResult<()> {
        let mut records = self.records.write().await;
        set_status(&mut records, hash, status);
        Ok(())
    }

    async fn update_other_transactions_as_failed_by_nonce(
        &self,
        sender_address: Address,
        nonce: u64,
        exclude_hash: H256,
    ) -> SenderResult<()> {
        let mut records = self.records.write().await;
        fail_siblings(&mut records, sender_address, nonce, exclude_hash);
        Ok(())
    }

    async fn pending_or_replaced_by_sender_type(
        &self,
        sender_type: SenderType,
        limit: usize,
    ) -> SenderResult<Vec<PendingTransaction>> {
        let records = self.records.read().await;
        let mut open: Vec<PendingTransaction> = records
            .iter()
            .filter(|r| {
                r.sender.sender_type == sender_type
                    && matches!(r.status, TxStatus::Pending | TxStatus::Replaced)
            })
            .cloned()
            .collect();
        open.sort_by_key(|r| (r.nonce, r.gas_fee_cap));
        open.truncate(limit);
        Ok(open)
    }

    async fn count_pending_by_sender_type(&self, sender_type: SenderType) -> SenderResult<u64> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.sender.sender_type == sender_type && r.status == TxStatus::Pending)
            .count() as u64)
    }

    async fn status_by_hash(&self, hash: H256) -> SenderResult<Option<TxStatus>> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.hash == hash).map(|r| r.status))
    }
}
