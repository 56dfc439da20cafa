//! Confirmation routing into rollup status transitions

use crate::error::SenderResult;
use crate::types::{Confirmation, SenderType};

use async_trait::async_trait;
use ethers::types::H256;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Context id prefix of bundle finalization transactions
pub const FINALIZE_BUNDLE_PREFIX: &str = "finalizeBundle-";

/// Rollup status of a batch or bundle after its transaction settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupStatus {
    Committed,
    CommitFailed,
    Finalized,
    FinalizeFailed,
}

/// Status of a gas oracle update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasOracleStatus {
    Imported,
    ImportedFailed,
}

/// A status transition derived from one confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    BatchCommit {
        batch_hash: String,
        tx_hash: H256,
        status: RollupStatus,
    },
    BatchFinalize {
        batch_hash: String,
        tx_hash: H256,
        status: RollupStatus,
    },
    /// Finalizes the bundle and every batch in it
    BundleFinalize {
        bundle_hash: String,
        tx_hash: H256,
        status: RollupStatus,
    },
    GasOracle {
        sender_type: SenderType,
        block_hash: String,
        tx_hash: H256,
        status: GasOracleStatus,
    },
}

/// Map a confirmation to the status transition it causes, if any
pub fn route(confirmation: &Confirmation) -> Option<StatusUpdate> {
    let tx_hash = confirmation.tx_hash;
    let ok = confirmation.is_successful;

    match confirmation.sender_type {
        SenderType::CommitBatch => Some(StatusUpdate::BatchCommit {
            batch_hash: confirmation.context_id.clone(),
            tx_hash,
            status: if ok {
                RollupStatus::Committed
            } else {
                RollupStatus::CommitFailed
            },
        }),
        SenderType::FinalizeBatch => {
            let status = if ok {
                RollupStatus::Finalized
            } else {
                RollupStatus::FinalizeFailed
            };
            match confirmation.context_id.strip_prefix(FINALIZE_BUNDLE_PREFIX) {
                Some(bundle_hash) => Some(StatusUpdate::BundleFinalize {
                    bundle_hash: bundle_hash.to_string(),
                    tx_hash,
                    status,
                }),
                None => Some(StatusUpdate::BatchFinalize {
                    batch_hash: confirmation.context_id.clone(),
                    tx_hash,
                    status,
                }),
            }
        }
        SenderType::L1GasOracle | SenderType::L2GasOracle => Some(StatusUpdate::GasOracle {
            sender_type: confirmation.sender_type,
            block_hash: confirmation.context_id.clone(),
            tx_hash,
            status: if ok {
                GasOracleStatus::Imported
            } else {
                GasOracleStatus::ImportedFailed
            },
        }),
        SenderType::Unknown => None,
    }
}

/// Durable rollup state the router drives
#[async_trait]
pub trait RollupStatusSink: Send + Sync {
    async fn apply(&self, update: &StatusUpdate) -> SenderResult<()>;
}

/// Sink that only logs transitions
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStatusSink;

#[async_trait]
impl RollupStatusSink for LoggingStatusSink {
    async fn apply(&self, update: &StatusUpdate) -> SenderResult<()> {
        info!(?update, "Rollup status transition");
        Ok(())
    }
}

/// Consumes sender confirmations and applies the resulting status updates
pub struct ConfirmationRouter {
    sink: Arc<dyn RollupStatusSink>,
}

impl ConfirmationRouter {
    pub fn new(sink: Arc<dyn RollupStatusSink>) -> Self {
        Self { sink }
    }

    /// Apply one confirmation. Sink failures are logged, never retried.
    pub async fn handle(&self, confirmation: &Confirmation) {
        let Some(update) = route(confirmation) else {
            warn!(?confirmation, "Unknown sender type, dropping confirmation");
            return;
        };

        if !confirmation.is_successful {
            warn!(?confirmation, "Transaction confirmed but failed");
        }

        if let Err(e) = self.sink.apply(&update).await {
            warn!(?confirmation, error = %e, "Failed to apply rollup status update");
        }
    }

    /// Merge the confirmation streams of several senders and route them
    /// until cancelled or every stream has closed
    pub async fn run(
        self,
        receivers: Vec<mpsc::Receiver<Confirmation>>,
        cancel: CancellationToken,
    ) {
        let mut confirmations = stream::select_all(receivers.into_iter().map(ReceiverStream::new));
        info!("Confirmation router started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Confirmation router stopped");
                    return;
                }
                next = confirmations.next() => match next {
                    Some(confirmation) => {
                        debug!(context_id = %confirmation.context_id, "Routing confirmation");
                        self.handle(&confirmation).await;
                    }
                    None => {
                        info!("All confirmation streams closed");
                        return;
                    }
                }
            }
        }
    }
}
