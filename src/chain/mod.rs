//! Chain module - the RPC boundary the sender talks to
//!
//! This module provides:
//! - The `ChainClient` capability consumed by the sender and fee estimator
//! - An ethers-backed HTTP implementation
//! - Confirmation depth resolution

pub mod finality;
pub mod provider;

pub use finality::latest_confirmed_block_number;
pub use provider::{ChainProvider, GasPrice};

use crate::error::SenderResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};

/// Block selector for header queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Safe,
    Finalized,
    Number(u64),
}

/// The subset of a block header the sender needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub base_fee_per_gas: Option<U256>,
}

/// Inclusion data of a mined transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub block_number: u64,
    pub status: bool,
}

/// Dry-run call used for gas estimation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMsg {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub gas_price: Option<U256>,
    pub gas_tip_cap: Option<U256>,
    pub gas_fee_cap: Option<U256>,
}

/// Chain RPC capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> SenderResult<u64>;

    async fn pending_nonce_at(&self, address: Address) -> SenderResult<u64>;

    async fn suggest_gas_price(&self) -> SenderResult<U256>;

    async fn suggest_gas_tip_cap(&self) -> SenderResult<U256>;

    async fn estimate_gas(&self, msg: &CallMsg) -> SenderResult<u64>;

    async fn header_by_number(&self, tag: BlockTag) -> SenderResult<BlockHeader>;

    /// Broadcast a signed transaction, returning its hash
    async fn send_raw_transaction(&self, raw: Bytes) -> SenderResult<H256>;

    /// `None` while the transaction is not mined
    async fn transaction_receipt(&self, hash: H256) -> SenderResult<Option<TxReceipt>>;
}
