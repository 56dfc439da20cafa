//! Transaction sender with nonce management, fee escalation and confirmation tracking
//!
//! One `Sender` owns one account on one chain. `send` broadcasts and persists
//! a transaction; a background task watches every open record of the
//! sender's type, settles confirmed ones and replaces stale ones with
//! fee-bumped copies at the same nonce.

use super::gas::{Escalator, FeeData, FeeEstimator};
use super::signer::{build_signer, SignedTx, TransactionSigner, UnsignedTx};
use crate::chain::{latest_confirmed_block_number, BlockTag, ChainClient, GasPrice};
use crate::config::{SenderConfig, SignerConfig};
use crate::error::{SenderError, SenderResult};
use crate::metrics::SenderMetrics;
use crate::state::{PendingTransaction, PendingTxStore};
use crate::types::{Confirmation, SenderMeta, SenderType, TxStatus, TxType};

use ethers::types::{Address, Bytes, H256, U256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the confirmation channel
pub const CONFIRM_CHANNEL_CAPACITY: usize = 128;

/// Open records loaded per check
const PENDING_BATCH_LIMIT: usize = 100;

/// Transaction sender for one account
pub struct Sender {
    inner: Arc<SenderInner>,
    confirm_rx: std::sync::Mutex<Option<mpsc::Receiver<Confirmation>>>,
}

struct SenderInner {
    config: SenderConfig,
    meta: SenderMeta,
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    store: Arc<dyn PendingTxStore>,
    metrics: Arc<dyn SenderMetrics>,
    estimator: FeeEstimator,
    escalator: Escalator,
    /// Signer and its nonce; held across estimate, sign, broadcast and persist
    signer: Mutex<Box<dyn TransactionSigner>>,
    block_number: AtomicU64,
    base_fee: AtomicU64,
    confirm_tx: mpsc::Sender<Confirmation>,
    cancel: CancellationToken,
}

impl Sender {
    /// Create a sender and start its background check loop.
    ///
    /// The loop stops on `stop()` or when `parent` is cancelled.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: SenderConfig,
        signer_config: &SignerConfig,
        service: &str,
        name: &str,
        sender_type: SenderType,
        client: Arc<dyn ChainClient>,
        store: Arc<dyn PendingTxStore>,
        metrics: Arc<dyn SenderMetrics>,
        parent: &CancellationToken,
    ) -> SenderResult<Self> {
        config.validate()?;
        let escalator = Escalator::new(
            config.escalate_multiple_num,
            config.escalate_multiple_den,
            config.max_gas_price,
        )?;

        let chain_id = client.chain_id().await?;
        let mut signer = build_signer(signer_config, chain_id)?;
        let address = signer.address();

        let nonce = client.pending_nonce_at(address).await?;
        signer.set_nonce(nonce);

        let header = client.header_by_number(BlockTag::Latest).await?;
        if config.tx_type == TxType::DynamicFee && header.base_fee_per_gas.is_none() {
            return Err(SenderError::Config(format!(
                "sender {} uses {} but the chain reports no base fee",
                name, config.tx_type
            )));
        }
        let base_fee = header.base_fee_per_gas.map(saturating_u64).unwrap_or_default();

        let meta = SenderMeta {
            name: name.to_string(),
            service: service.to_string(),
            address,
            sender_type,
        };

        let (confirm_tx, confirm_rx) = mpsc::channel(CONFIRM_CHANNEL_CAPACITY);

        let inner = Arc::new(SenderInner {
            estimator: FeeEstimator::new(client.clone(), config.tx_type, config.min_gas_tip),
            escalator,
            config,
            meta,
            chain_id,
            client,
            store,
            metrics,
            signer: Mutex::new(signer),
            block_number: AtomicU64::new(header.number),
            base_fee: AtomicU64::new(base_fee),
            confirm_tx,
            cancel: parent.child_token(),
        });

        info!(
            service = %inner.meta.service,
            name = %inner.meta.name,
            sender_type = %sender_type,
            address = ?address,
            chain_id,
            nonce,
            tx_type = %inner.config.tx_type,
            "Sender initialized"
        );

        tokio::spawn(inner.clone().run());

        Ok(Self {
            inner,
            confirm_rx: std::sync::Mutex::new(Some(confirm_rx)),
        })
    }

    /// Build, sign, broadcast and persist a transaction for `context_id`
    pub async fn send(
        &self,
        context_id: &str,
        target: Option<Address>,
        value: U256,
        data: Bytes,
        fallback_gas_limit: u64,
    ) -> SenderResult<H256> {
        self.inner
            .send(context_id, target, value, data, fallback_gas_limit)
            .await
    }

    /// Stream of final outcomes. Handed out once; later calls return `None`.
    pub fn confirm_chan(&self) -> Option<mpsc::Receiver<Confirmation>> {
        self.confirm_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Stop the background loop. Queued confirmations stay readable.
    pub fn stop(&self) {
        info!(name = %self.inner.meta.name, "Stopping sender");
        self.inner.cancel.cancel();
    }

    pub fn chain_id(&self) -> u64 {
        self.inner.chain_id
    }

    pub fn address(&self) -> Address {
        self.inner.meta.address
    }

}

impl SenderInner {
    async fn send(
        &self,
        context_id: &str,
        target: Option<Address>,
        value: U256,
        data: Bytes,
        fallback_gas_limit: u64,
    ) -> SenderResult<H256> {
        if self.cancel.is_cancelled() {
            return Err(SenderError::Stopped(self.meta.name.clone()));
        }

        if self.config.pending_limit > 0 {
            let count = self
                .store
                .count_pending_by_sender_type(self.meta.sender_type)
                .await?;
            if count >= self.config.pending_limit {
                warn!(
                    name = %self.meta.name,
                    count,
                    limit = self.config.pending_limit,
                    "Too many pending transactions"
                );
                return Err(SenderError::TooManyPending {
                    count,
                    limit: self.config.pending_limit,
                });
            }
        }

        let mut signer = self.signer.lock().await;

        let fee = self
            .estimator
            .estimate(
                signer.address(),
                target,
                value,
                &data,
                U256::from(self.base_fee.load(Ordering::Relaxed)),
                fallback_gas_limit,
            )
            .await
            .map_err(|e| {
                self.metrics.record_get_fee_failure(&self.meta);
                error!(
                    name = %self.meta.name,
                    context_id,
                    fallback_gas_limit,
                    error = %e,
                    "Failed to estimate fees"
                );
                e
            })?;

        let nonce = signer.nonce();
        let unsigned = UnsignedTx::new(
            self.config.tx_type,
            signer.address(),
            target,
            value,
            data,
            nonce,
            fee.gas_limit,
            fee.gas_price,
        )?;

        let signed = self.sign_and_broadcast(&mut **signer, unsigned, false).await?;
        signer.set_nonce(nonce + 1);

        let record = PendingTransaction::new(
            context_id,
            &self.meta,
            self.chain_id,
            &signed,
            self.block_number.load(Ordering::Relaxed),
        );
        if let Err(e) = self.store.insert_pending_transaction(&record).await {
            error!(
                name = %self.meta.name,
                context_id,
                hash = ?signed.hash,
                nonce,
                raw = %hex::encode(&signed.raw),
                error = %e,
                "Broadcast transaction could not be persisted and is no longer tracked"
            );
            return Err(SenderError::Persistence(e.to_string()));
        }

        self.metrics.record_send(&self.meta);
        self.record_fees(&fee);

        info!(
            name = %self.meta.name,
            context_id,
            hash = ?signed.hash,
            nonce,
            gas_limit = fee.gas_limit,
            "Transaction sent"
        );

        Ok(signed.hash)
    }

    /// Sign `unsigned` and broadcast it.
    ///
    /// A nonce-related rejection of a fresh transaction resyncs the local
    /// nonce from the node; replacements keep their nonce untouched.
    async fn sign_and_broadcast(
        &self,
        signer: &mut dyn TransactionSigner,
        unsigned: UnsignedTx,
        is_resubmit: bool,
    ) -> SenderResult<SignedTx> {
        let signed = signer.sign_transaction(unsigned).await?;

        if let Err(e) = self.client.send_raw_transaction(signed.raw.clone()).await {
            self.metrics.record_broadcast_failure(&self.meta);
            error!(
                name = %self.meta.name,
                hash = ?signed.hash,
                nonce = signed.nonce(),
                is_resubmit,
                error = %e,
                "Failed to broadcast transaction"
            );
            if !is_resubmit && e.is_nonce_error() {
                self.reset_nonce(signer).await;
            }
            return Err(e);
        }

        Ok(signed)
    }

    /// Resync the local nonce with the node's pending nonce
    async fn reset_nonce(&self, signer: &mut dyn TransactionSigner) {
        match self.client.pending_nonce_at(signer.address()).await {
            Ok(nonce) => {
                warn!(
                    name = %self.meta.name,
                    local = signer.nonce(),
                    chain = nonce,
                    "Resetting nonce"
                );
                signer.set_nonce(nonce);
            }
            Err(e) => {
                warn!(name = %self.meta.name, error = %e, "Failed to reset nonce");
            }
        }
    }

    fn record_fees(&self, fee: &FeeData) {
        let as_f64 = |v: U256| saturating_u64(v) as f64;
        let gas_price = match fee.gas_price {
            GasPrice::Legacy(price) => as_f64(price),
            GasPrice::Eip1559 { .. } => 0.0,
        };
        self.metrics.record_fees(
            &self.meta,
            gas_price,
            as_f64(fee.gas_price.tip_cap()),
            as_f64(fee.gas_price.fee_cap()),
            fee.gas_limit as f64,
        );
    }

    async fn run(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.check_pending_time_secs);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(name = %self.meta.name, "Sender loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.check_pending_transactions().await {
                        Ok(()) => {}
                        Err(e) if e.should_alert() => {
                            error!(
                                name = %self.meta.name,
                                error = %e,
                                "Pending transaction check failed"
                            );
                        }
                        Err(e) => {
                            warn!(
                                name = %self.meta.name,
                                error = %e,
                                "Pending transaction check failed"
                            );
                        }
                    }
                }
            }
        }
    }

    /// One pass over the open records of this sender type
    async fn check_pending_transactions(&self) -> SenderResult<()> {
        self.metrics.record_check_pending(&self.meta);

        let header = self.client.header_by_number(BlockTag::Latest).await?;
        let block_number = header.number;
        self.block_number.store(block_number, Ordering::Relaxed);
        let base_fee = match header.base_fee_per_gas {
            Some(base_fee) => {
                self.base_fee.store(saturating_u64(base_fee), Ordering::Relaxed);
                base_fee
            }
            None => {
                if self.config.tx_type == TxType::DynamicFee {
                    error!(
                        name = %self.meta.name,
                        block_number,
                        "Head has no base fee, keeping last observed value"
                    );
                }
                U256::from(self.base_fee.load(Ordering::Relaxed))
            }
        };

        let records = self
            .store
            .pending_or_replaced_by_sender_type(self.meta.sender_type, PENDING_BATCH_LIMIT)
            .await?;
        if records.is_empty() {
            return Ok(());
        }

        let confirmed =
            latest_confirmed_block_number(self.client.as_ref(), self.config.confirmations).await?;

        debug!(
            name = %self.meta.name,
            open = records.len(),
            block_number,
            confirmed,
            "Checking pending transactions"
        );

        for record in records {
            let signed = match SignedTx::decode(&record.raw) {
                Ok(signed) => signed,
                Err(e) => {
                    error!(
                        name = %self.meta.name,
                        context_id = %record.context_id,
                        hash = ?record.hash,
                        error = %e,
                        "Skipping undecodable pending transaction"
                    );
                    continue;
                }
            };

            let receipt = match self.client.transaction_receipt(signed.hash).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!(hash = ?signed.hash, error = %e, "Failed to fetch receipt");
                    None
                }
            };

            match receipt {
                // Mined: wait for depth, never replace.
                Some(receipt) => {
                    if receipt.block_number <= confirmed
                        && !self.settle(&record, receipt.status).await
                    {
                        return Ok(());
                    }
                }
                None if record.status == TxStatus::Pending
                    && record.submit_block_number + self.config.escalate_blocks
                        < block_number =>
                {
                    self.escalate(&record, &signed, base_fee, block_number).await;
                }
                None => {}
            }
        }

        Ok(())
    }

    /// Persist the outcome of a confirmed record and emit its confirmation.
    ///
    /// Returns `false` when the sender was stopped while the channel was full.
    async fn settle(&self, record: &PendingTransaction, successful: bool) -> bool {
        let status = if successful {
            TxStatus::Confirmed
        } else {
            TxStatus::ConfirmedFailed
        };

        if let Err(e) = self
            .store
            .confirm_transaction(record.hash, status, record.sender.address, record.nonce)
            .await
        {
            error!(
                context_id = %record.context_id,
                hash = ?record.hash,
                error = %e,
                "Failed to persist confirmation"
            );
            return true;
        }

        self.metrics.record_confirmation(&self.meta, successful);
        info!(
            name = %self.meta.name,
            context_id = %record.context_id,
            hash = ?record.hash,
            nonce = record.nonce,
            successful,
            "Transaction confirmed"
        );

        let confirmation = Confirmation {
            context_id: record.context_id.clone(),
            tx_hash: record.hash,
            is_successful: successful,
            sender_type: self.meta.sender_type,
        };

        // blocks while the consumer lags behind
        tokio::select! {
            sent = self.confirm_tx.send(confirmation) => {
                if sent.is_err() {
                    warn!(context_id = %record.context_id, "Confirmation receiver dropped");
                }
                true
            }
            _ = self.cancel.cancelled() => {
                warn!(
                    context_id = %record.context_id,
                    "Sender stopped before confirmation could be delivered"
                );
                false
            }
        }
    }

    /// Replace a stale record with a fee-bumped copy at the same nonce
    async fn escalate(
        &self,
        record: &PendingTransaction,
        original: &SignedTx,
        base_fee: U256,
        block_number: u64,
    ) {
        // a sibling may have been confirmed earlier in this pass
        match self.store.status_by_hash(record.hash).await {
            Ok(Some(TxStatus::ConfirmedFailed)) => {
                debug!(hash = ?record.hash, "Skipping escalation of settled transaction");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(hash = ?record.hash, error = %e, "Failed to re-check transaction status");
                return;
            }
        }

        match self.resubmit_transaction(record, original, base_fee, block_number).await {
            Ok(hash) => {
                self.metrics.record_resubmit(&self.meta);
                info!(
                    name = %self.meta.name,
                    context_id = %record.context_id,
                    old_hash = ?record.hash,
                    new_hash = ?hash,
                    nonce = record.nonce,
                    "Resubmitted transaction"
                );
            }
            Err(e) => {
                self.metrics.record_resubmit_failure(&self.meta);
                warn!(
                    name = %self.meta.name,
                    context_id = %record.context_id,
                    hash = ?record.hash,
                    error = %e,
                    "Failed to resubmit transaction, retrying next tick"
                );
            }
        }
    }

    async fn resubmit_transaction(
        &self,
        record: &PendingTransaction,
        original: &SignedTx,
        base_fee: U256,
        block_number: u64,
    ) -> SenderResult<H256> {
        let mut signer = self.signer.lock().await;

        let gas_price = self.escalator.escalate(&original.gas_price(), base_fee);
        let unsigned = UnsignedTx::replacement(&original.tx, gas_price)?;
        let signed = self.sign_and_broadcast(&mut **signer, unsigned, true).await?;

        let successor = PendingTransaction::new(
            &record.context_id,
            &self.meta,
            self.chain_id,
            &signed,
            block_number,
        );
        if let Err(e) = self
            .store
            .replace_pending_transaction(record.hash, &successor)
            .await
        {
            error!(
                name = %self.meta.name,
                context_id = %record.context_id,
                hash = ?signed.hash,
                nonce = record.nonce,
                raw = %hex::encode(&signed.raw),
                error = %e,
                "Replacement transaction could not be persisted and is no longer tracked"
            );
            return Err(SenderError::Persistence(e.to_string()));
        }

        self.record_fees(&FeeData {
            gas_price,
            gas_limit: signed.gas_limit(),
        });

        Ok(signed.hash)
    }
}

fn saturating_u64(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Confirmations;
    use crate::metrics::NoopSenderMetrics;
    use crate::state::MemoryPendingTxStore;
    use crate::testing::{sender_config, signer_config, FakeChain, GWEI};
    use tokio::sync::mpsc::error::TryRecvError;

    async fn new_sender(
        chain: Arc<FakeChain>,
        store: MemoryPendingTxStore,
        config: SenderConfig,
    ) -> SenderResult<Sender> {
        Sender::new(
            config,
            &signer_config(),
            "test",
            "commit",
            SenderType::CommitBatch,
            chain,
            Arc::new(store),
            Arc::new(NoopSenderMetrics),
            &CancellationToken::new(),
        )
        .await
    }

    fn legacy_config() -> SenderConfig {
        sender_config(TxType::Legacy)
    }

    fn dynamic_config() -> SenderConfig {
        sender_config(TxType::DynamicFee)
    }

    fn target() -> Option<Address> {
        Some(Address::repeat_byte(0x42))
    }

    #[tokio::test]
    async fn test_invalid_ratio_rejected_at_construction() {
        let mut config = sender_config(TxType::Legacy);
        config.escalate_multiple_num = 10;
        let result = new_sender(FakeChain::new(), MemoryPendingTxStore::new(), config).await;

        match result {
            Err(SenderError::Config(message)) => assert!(message.contains("escalate_multiple_num")),
            _ => panic!("expected a config error"),
        }
    }

    #[tokio::test]
    async fn test_send_persists_pending_record_and_advances_nonce() {
        let chain = FakeChain::new();
        chain.with(|s| s.pending_nonce = 7);
        let store = MemoryPendingTxStore::new();
        let sender = new_sender(chain.clone(), store.clone(), sender_config(TxType::DynamicFee))
            .await
            .unwrap();

        let first = sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        let second = sender.send("batch-2", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        assert_ne!(first, second);

        let records = store.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].nonce, 7);
        assert_eq!(records[1].nonce, 8);
        assert_eq!(records[0].status, TxStatus::Pending);
        assert_eq!(records[0].submit_block_number, 100);
        assert_eq!(records[0].sender.address, sender.address());
        assert!(chain.last_sent().gas_limit() > 0);
    }

    #[tokio::test]
    async fn test_fallback_gas_limit_used_verbatim() {
        let chain = FakeChain::new();
        chain.with(|s| s.estimate = None);
        let sender = new_sender(chain.clone(), MemoryPendingTxStore::new(), legacy_config())
            .await
            .unwrap();

        sender
            .send("batch-1", target(), U256::zero(), Bytes::new(), 100_000)
            .await
            .unwrap();
        assert_eq!(chain.last_sent().gas_limit(), 100_000);

        let err = sender
            .send("batch-2", target(), U256::zero(), Bytes::new(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::GasEstimation(_)));
        assert_eq!(chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_nonce_error_resyncs_from_chain() {
        let chain = FakeChain::new();
        let sender = new_sender(chain.clone(), MemoryPendingTxStore::new(), legacy_config())
            .await
            .unwrap();

        sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        assert_eq!(chain.last_sent().nonce(), 0);

        // the account was used out of band
        chain.with(|s| {
            s.pending_nonce = 5;
            s.broadcast_errors.push_back("nonce too low".to_string());
        });
        let err = sender
            .send("batch-2", target(), U256::zero(), Bytes::new(), 0)
            .await
            .unwrap_err();
        assert!(err.is_nonce_error());

        sender.send("batch-2", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        assert_eq!(chain.last_sent().nonce(), 5);
    }

    #[tokio::test]
    async fn test_other_broadcast_errors_keep_nonce() {
        let chain = FakeChain::new();
        let sender = new_sender(chain.clone(), MemoryPendingTxStore::new(), legacy_config())
            .await
            .unwrap();

        chain.with(|s| {
            s.pending_nonce = 9;
            s.broadcast_errors.push_back("insufficient funds".to_string());
        });
        assert!(sender
            .send("batch-1", target(), U256::zero(), Bytes::new(), 0)
            .await
            .is_err());

        sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        assert_eq!(chain.last_sent().nonce(), 0);
    }

    #[tokio::test]
    async fn test_confirmation_emitted_once() {
        let chain = FakeChain::new();
        let store = MemoryPendingTxStore::new();
        let sender = new_sender(chain.clone(), store.clone(), sender_config(TxType::DynamicFee))
            .await
            .unwrap();
        let mut confirmations = sender.confirm_chan().unwrap();
        assert!(sender.confirm_chan().is_none());

        let hash = sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        chain.mine(hash, true);

        sender.inner.check_pending_transactions().await.unwrap();
        sender.inner.check_pending_transactions().await.unwrap();

        let confirmation = confirmations.try_recv().unwrap();
        assert_eq!(
            confirmation,
            Confirmation {
                context_id: "batch-1".to_string(),
                tx_hash: hash,
                is_successful: true,
                sender_type: SenderType::CommitBatch,
            }
        );
        assert_eq!(confirmations.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(store.status_by_hash(hash).await.unwrap(), Some(TxStatus::Confirmed));
    }

    #[tokio::test]
    async fn test_reverted_receipt_confirms_as_failed() {
        let chain = FakeChain::new();
        let store = MemoryPendingTxStore::new();
        let sender = new_sender(chain.clone(), store.clone(), sender_config(TxType::Legacy))
            .await
            .unwrap();
        let mut confirmations = sender.confirm_chan().unwrap();

        let hash = sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        chain.mine(hash, false);
        sender.inner.check_pending_transactions().await.unwrap();

        assert!(!confirmations.try_recv().unwrap().is_successful);
        assert_eq!(
            store.status_by_hash(hash).await.unwrap(),
            Some(TxStatus::ConfirmedFailed)
        );
    }

    #[tokio::test]
    async fn test_receipt_above_confirmation_depth_is_not_final() {
        let chain = FakeChain::new();
        let mut config = sender_config(TxType::Legacy);
        config.confirmations = crate::config::Confirmations::Depth(6);
        let sender = new_sender(chain.clone(), MemoryPendingTxStore::new(), config)
            .await
            .unwrap();
        let mut confirmations = sender.confirm_chan().unwrap();

        let hash = sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        chain.mine(hash, true);
        sender.inner.check_pending_transactions().await.unwrap();
        assert_eq!(confirmations.try_recv(), Err(TryRecvError::Empty));

        chain.advance(6);
        sender.inner.check_pending_transactions().await.unwrap();
        assert_eq!(confirmations.try_recv().unwrap().tx_hash, hash);
    }

    #[tokio::test]
    async fn test_stale_transaction_is_replaced_and_siblings_fail() {
        let chain = FakeChain::new();
        let store = MemoryPendingTxStore::new();
        let sender = new_sender(chain.clone(), store.clone(), sender_config(TxType::Legacy))
            .await
            .unwrap();
        let mut confirmations = sender.confirm_chan().unwrap();

        let original = sender
            .send("batch-1", target(), U256::zero(), Bytes::new(), 0)
            .await
            .unwrap();

        // not stale yet
        chain.advance(10);
        sender.inner.check_pending_transactions().await.unwrap();
        assert_eq!(chain.sent().len(), 1);

        chain.advance(1);
        sender.inner.check_pending_transactions().await.unwrap();
        let replacement = chain.last_sent();
        assert_eq!(chain.sent().len(), 2);
        assert_eq!(replacement.nonce(), 0);
        assert_eq!(replacement.gas_price(), GasPrice::Legacy(U256::from(11 * GWEI / 10)));

        let records = store.records_by_context("batch-1").await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, TxStatus::Replaced);
        assert_eq!(records[1].status, TxStatus::Pending);
        assert_eq!(records[1].submit_block_number, 111);

        // the original wins the race
        chain.mine(original, true);
        sender.inner.check_pending_transactions().await.unwrap();
        sender.inner.check_pending_transactions().await.unwrap();

        assert_eq!(confirmations.try_recv().unwrap().tx_hash, original);
        assert_eq!(confirmations.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(store.status_by_hash(original).await.unwrap(), Some(TxStatus::Confirmed));
        assert_eq!(
            store.status_by_hash(replacement.hash).await.unwrap(),
            Some(TxStatus::ConfirmedFailed)
        );
        assert_eq!(chain.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_replacement_tracks_base_fee_jump() {
        let chain = FakeChain::new();
        let store = MemoryPendingTxStore::new();
        let sender = new_sender(chain.clone(), store.clone(), sender_config(TxType::DynamicFee))
            .await
            .unwrap();

        sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        assert_eq!(
            chain.last_sent().gas_price(),
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(3 * GWEI),
                max_priority_fee_per_gas: U256::from(GWEI),
            }
        );

        chain.with(|s| s.base_fee = Some(U256::from(10 * GWEI)));
        chain.advance(11);
        sender.inner.check_pending_transactions().await.unwrap();

        let tip = 11 * GWEI / 10;
        assert_eq!(
            chain.last_sent().gas_price(),
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(tip + 11 * GWEI),
                max_priority_fee_per_gas: U256::from(tip),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_base_fee_keeps_last_observed() {
        let chain = FakeChain::new();
        let sender = new_sender(chain.clone(), MemoryPendingTxStore::new(), dynamic_config())
            .await
            .unwrap();

        sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        chain.with(|s| s.base_fee = Some(U256::from(10 * GWEI)));
        sender.inner.check_pending_transactions().await.unwrap();
        assert_eq!(chain.sent().len(), 1);

        chain.with(|s| s.base_fee = None);
        chain.advance(11);
        sender.inner.check_pending_transactions().await.unwrap();

        assert_eq!(sender.inner.base_fee.load(Ordering::Relaxed), 10 * GWEI);
        let tip = 11 * GWEI / 10;
        assert_eq!(
            chain.last_sent().gas_price(),
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(tip + 11 * GWEI),
                max_priority_fee_per_gas: U256::from(tip),
            }
        );
    }

    #[tokio::test]
    async fn test_mined_transaction_is_not_replaced_while_awaiting_depth() {
        let chain = FakeChain::new();
        let store = MemoryPendingTxStore::new();
        let mut config = sender_config(TxType::Legacy);
        config.confirmations = Confirmations::Depth(64);
        let sender = new_sender(chain.clone(), store.clone(), config).await.unwrap();
        let mut confirmations = sender.confirm_chan().unwrap();

        let hash = sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        chain.mine(hash, true);
        chain.advance(11);
        sender.inner.check_pending_transactions().await.unwrap();

        assert_eq!(chain.sent().len(), 1);
        assert_eq!(store.records().await.len(), 1);
        assert_eq!(store.status_by_hash(hash).await.unwrap(), Some(TxStatus::Pending));
        assert_eq!(confirmations.try_recv(), Err(TryRecvError::Empty));

        chain.advance(64);
        sender.inner.check_pending_transactions().await.unwrap();

        assert_eq!(chain.sent().len(), 1);
        assert_eq!(store.status_by_hash(hash).await.unwrap(), Some(TxStatus::Confirmed));
        assert_eq!(confirmations.try_recv().unwrap().tx_hash, hash);
    }

    #[tokio::test]
    async fn test_failed_resubmission_keeps_record_pending() {
        let chain = FakeChain::new();
        let store = MemoryPendingTxStore::new();
        let sender = new_sender(chain.clone(), store.clone(), sender_config(TxType::Legacy))
            .await
            .unwrap();

        let hash = sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        chain.advance(11);
        chain.with(|s| {
            s.pending_nonce = 40;
            s.broadcast_errors
                .push_back("replacement transaction underpriced".to_string());
        });
        sender.inner.check_pending_transactions().await.unwrap();

        assert_eq!(store.status_by_hash(hash).await.unwrap(), Some(TxStatus::Pending));
        assert_eq!(store.records().await.len(), 1);

        // retried on the next pass
        sender.inner.check_pending_transactions().await.unwrap();
        assert_eq!(store.records().await.len(), 2);
        // a replacement never touches the local nonce
        sender.send("batch-2", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        assert_eq!(chain.last_sent().nonce(), 1);
    }

    #[tokio::test]
    async fn test_pending_limit_rejects_before_signing() {
        let chain = FakeChain::new();
        let mut config = sender_config(TxType::Legacy);
        config.pending_limit = 1;
        let sender = new_sender(chain.clone(), MemoryPendingTxStore::new(), config)
            .await
            .unwrap();

        sender.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        let err = sender
            .send("batch-2", target(), U256::zero(), Bytes::new(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::TooManyPending { count: 1, limit: 1 }));
        assert_eq!(chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_restarted_sender_resumes_tracking() {
        let chain = FakeChain::new();
        let store = MemoryPendingTxStore::new();
        let first = new_sender(chain.clone(), store.clone(), sender_config(TxType::Legacy))
            .await
            .unwrap();
        let hash = first.send("batch-1", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        first.stop();

        let second = new_sender(chain.clone(), store.clone(), sender_config(TxType::Legacy))
            .await
            .unwrap();
        let mut confirmations = second.confirm_chan().unwrap();
        chain.mine(hash, true);
        second.inner.check_pending_transactions().await.unwrap();

        assert_eq!(confirmations.try_recv().unwrap().tx_hash, hash);

        second.send("batch-2", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        assert_eq!(chain.last_sent().nonce(), 1);
    }

    #[tokio::test]
    async fn test_send_after_stop_is_rejected() {
        let sender = new_sender(FakeChain::new(), MemoryPendingTxStore::new(), legacy_config())
            .await
            .unwrap();
        sender.stop();

        let err = sender
            .send("batch-1", target(), U256::zero(), Bytes::new(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Stopped(_)));
    }

    #[tokio::test]
    async fn test_undecodable_record_is_skipped() {
        let chain = FakeChain::new();
        let store = MemoryPendingTxStore::new();
        let sender = new_sender(chain.clone(), store.clone(), sender_config(TxType::Legacy))
            .await
            .unwrap();
        let mut confirmations = sender.confirm_chan().unwrap();

        let hash = sender.send("batch-2", target(), U256::zero(), Bytes::new(), 0).await.unwrap();
        let mut corrupt = store.records().await[0].clone();
        corrupt.context_id = "batch-1".to_string();
        corrupt.hash = H256::repeat_byte(0xee);
        corrupt.raw = Bytes::from(vec![0xff, 0x00]);
        corrupt.gas_fee_cap = 0;
        store.insert_pending_transaction(&corrupt).await.unwrap();

        chain.mine(hash, true);
        tokio_test::assert_ok!(sender.inner.check_pending_transactions().await);
        assert_eq!(confirmations.try_recv().unwrap().context_id, "batch-2");
    }
}
