//! Chain provider backed by an ethers HTTP client

use super::{BlockHeader, BlockTag, CallMsg, ChainClient, TxReceipt};
use crate::error::{SenderError, SenderResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::time::Duration;
use tracing::debug;

/// HTTP chain provider
pub struct ChainProvider {
    endpoint: String,
    http: Provider<Http>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(endpoint: &str) -> SenderResult<Self> {
        let http = Provider::<Http>::try_from(endpoint)
            .map_err(|e| {
                SenderError::ChainConnection(format!("Invalid RPC endpoint {}: {}", endpoint, e))
            })?
            .interval(Duration::from_millis(100));

        debug!("Created HTTP provider for {}", endpoint);

        Ok(Self {
            endpoint: endpoint.to_string(),
            http,
        })
    }

    fn connection_error(&self, e: ProviderError) -> SenderError {
        SenderError::ChainConnection(format!("{}: {}", self.endpoint, e))
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    async fn chain_id(&self) -> SenderResult<u64> {
        let chain_id = self
            .http
            .get_chainid()
            .await
            .map_err(|e| self.connection_error(e))?;
        Ok(chain_id.low_u64())
    }

    async fn pending_nonce_at(&self, address: Address) -> SenderResult<u64> {
        let nonce = self
            .http
            .get_transaction_count(address, Some(BlockId::Number(BlockNumber::Pending)))
            .await
            .map_err(|e| SenderError::Nonce {
                address: format!("{:?}", address),
                message: e.to_string(),
            })?;
        Ok(nonce.low_u64())
    }

    async fn suggest_gas_price(&self) -> SenderResult<U256> {
        self.http
            .get_gas_price()
            .await
            .map_err(|e| SenderError::GasEstimation(e.to_string()))
    }

    async fn suggest_gas_tip_cap(&self) -> SenderResult<U256> {
        self.http
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
            .map_err(|e| SenderError::GasEstimation(e.to_string()))
    }

    async fn estimate_gas(&self, msg: &CallMsg) -> SenderResult<u64> {
        let tx: TypedTransaction = match (msg.gas_tip_cap, msg.gas_fee_cap) {
            (Some(tip), Some(fee_cap)) => {
                let mut request = Eip1559TransactionRequest::new()
                    .from(msg.from)
                    .value(msg.value)
                    .data(msg.data.clone())
                    .max_priority_fee_per_gas(tip)
                    .max_fee_per_gas(fee_cap);
                if let Some(to) = msg.to {
                    request = request.to(to);
                }
                request.into()
            }
            _ => {
                let mut request = TransactionRequest::new()
                    .from(msg.from)
                    .value(msg.value)
                    .data(msg.data.clone());
                if let Some(price) = msg.gas_price {
                    request = request.gas_price(price);
                }
                if let Some(to) = msg.to {
                    request = request.to(to);
                }
                request.into()
            }
        };

        let gas = self
            .http
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| SenderError::GasEstimation(e.to_string()))?;
        Ok(gas.low_u64())
    }

    async fn header_by_number(&self, tag: BlockTag) -> SenderResult<BlockHeader> {
        let number = match tag {
            BlockTag::Latest => BlockNumber::Latest,
            BlockTag::Safe => BlockNumber::Safe,
            BlockTag::Finalized => BlockNumber::Finalized,
            BlockTag::Number(n) => BlockNumber::Number(n.into()),
        };

        let block = self
            .http
            .get_block(number)
            .await
            .map_err(|e| self.connection_error(e))?
            .ok_or_else(|| SenderError::ChainConnection(format!("Block {:?} not found", tag)))?;

        let number = block
            .number
            .ok_or_else(|| SenderError::ChainConnection(format!("Block {:?} has no number", tag)))?;

        Ok(BlockHeader {
            number: number.as_u64(),
            base_fee_per_gas: block.base_fee_per_gas,
        })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> SenderResult<H256> {
        let pending = self
            .http
            .send_raw_transaction(raw)
            .await
            .map_err(|e| SenderError::Broadcast(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: H256) -> SenderResult<Option<TxReceipt>> {
        let receipt = self
            .http
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.connection_error(e))?;

        Ok(receipt.and_then(|r| {
            r.block_number.map(|block_number| TxReceipt {
                block_number: block_number.as_u64(),
                status: r.status == Some(1u64.into()),
            })
        }))
    }
}

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// The most this price can charge per gas
    pub fn fee_cap(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// Tip paid to the block producer; the full price for legacy kinds
    pub fn tip_cap(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_priority_fee_per_gas,
                ..
            } => *max_priority_fee_per_gas,
        }
    }
}
