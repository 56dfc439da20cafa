//! Rollup transaction sender
//!
//! Delivers protocol transactions (batch commits, finalizations, gas oracle
//! updates) to a target chain: nonce management, fee estimation, gas
//! escalation of stuck transactions and confirmation tracking.

pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod state;
pub mod tx;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{SenderError, SenderResult};
pub use tx::Sender;
pub use types::{Confirmation, SenderMeta, SenderType, TxStatus, TxType};
