//! Shared enumerations and the confirmation record emitted by senders

use crate::error::SenderError;

use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Purpose of a sender; scopes which pending records a sender watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Unknown,
    CommitBatch,
    FinalizeBatch,
    L1GasOracle,
    L2GasOracle,
}

impl SenderType {
    pub fn as_i16(self) -> i16 {
        match self {
            SenderType::Unknown => 0,
            SenderType::CommitBatch => 1,
            SenderType::FinalizeBatch => 2,
            SenderType::L1GasOracle => 3,
            SenderType::L2GasOracle => 4,
        }
    }
}

impl TryFrom<i16> for SenderType {
    type Error = SenderError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SenderType::Unknown),
            1 => Ok(SenderType::CommitBatch),
            2 => Ok(SenderType::FinalizeBatch),
            3 => Ok(SenderType::L1GasOracle),
            4 => Ok(SenderType::L2GasOracle),
            other => Err(SenderError::Decode(format!("unknown sender type {}", other))),
        }
    }
}

impl fmt::Display for SenderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SenderType::Unknown => "unknown",
            SenderType::CommitBatch => "commit_batch",
            SenderType::FinalizeBatch => "finalize_batch",
            SenderType::L1GasOracle => "l1_gas_oracle",
            SenderType::L2GasOracle => "l2_gas_oracle",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of one submitted transaction attempt.
///
/// `Pending -> {Confirmed | ConfirmedFailed}` is terminal. `Pending -> Replaced`
/// is not: a replaced attempt is still watched because it may win the race
/// against its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Unknown,
    Pending,
    Replaced,
    Confirmed,
    ConfirmedFailed,
}

impl TxStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            TxStatus::Unknown => 0,
            TxStatus::Pending => 1,
            TxStatus::Replaced => 2,
            TxStatus::Confirmed => 3,
            TxStatus::ConfirmedFailed => 4,
        }
    }

    /// Whether no further transition can happen
    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::ConfirmedFailed)
    }
}

impl TryFrom<i16> for TxStatus {
    type Error = SenderError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TxStatus::Unknown),
            1 => Ok(TxStatus::Pending),
            2 => Ok(TxStatus::Replaced),
            3 => Ok(TxStatus::Confirmed),
            4 => Ok(TxStatus::ConfirmedFailed),
            other => Err(SenderError::Decode(format!("unknown tx status {}", other))),
        }
    }
}

/// Transaction kind a sender builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    #[serde(rename = "LegacyTx")]
    Legacy,
    #[serde(rename = "AccessListTx")]
    AccessList,
    #[serde(rename = "DynamicFeeTx")]
    DynamicFee,
}

impl TxType {
    /// EIP-2718 type byte
    pub fn as_u8(self) -> u8 {
        match self {
            TxType::Legacy => 0,
            TxType::AccessList => 1,
            TxType::DynamicFee => 2,
        }
    }
}

impl TryFrom<u8> for TxType {
    type Error = SenderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TxType::Legacy),
            1 => Ok(TxType::AccessList),
            2 => Ok(TxType::DynamicFee),
            other => Err(SenderError::Decode(format!("unknown tx type {}", other))),
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxType::Legacy => "LegacyTx",
            TxType::AccessList => "AccessListTx",
            TxType::DynamicFee => "DynamicFeeTx",
        };
        f.write_str(name)
    }
}

/// Final outcome of one logical transaction, emitted once per context id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub context_id: String,
    pub tx_hash: H256,
    pub is_successful: bool,
    pub sender_type: SenderType,
}

/// Identity of a sender, persisted alongside every record it submits
#[derive(Debug, Clone)]
pub struct SenderMeta {
    pub name: String,
    pub service: String,
    pub address: Address,
    pub sender_type: SenderType,
}
