//! Error types for the rollup transaction sender

use thiserror::Error;

/// Main error type for the sender
#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error: {0}")]
    ChainConnection(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Unsupported transaction type: {0}")]
    UnsupportedTransactionType(String),

    #[error("Nonce error for {address}: {message}")]
    Nonce { address: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Failed to decode transaction: {0}")]
    Decode(String),

    #[error("Too many pending transactions: {count} pending, limit {limit}")]
    TooManyPending { count: u64, limit: u64 },

    #[error("Sender {0} is stopped")]
    Stopped(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SenderError {
    /// Check if a broadcast failure was caused by a nonce conflict
    pub fn is_nonce_error(&self) -> bool {
        match self {
            SenderError::Broadcast(message) => message.contains("nonce"),
            SenderError::Nonce { .. } => true,
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SenderError::Persistence(_) | SenderError::Database(_) | SenderError::Signer(_)
        )
    }
}

/// Result type for sender operations
pub type SenderResult<T> = Result<T, SenderError>;
