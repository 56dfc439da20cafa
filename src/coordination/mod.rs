//! Relayer-side handling of sender confirmations
//!
//! The router:
//! 1. Merges the confirmation streams of all senders
//! 2. Maps each confirmation to a rollup or gas oracle status transition
//! 3. Hands the transition to a status sink

pub mod router;

pub use router::{
    route, ConfirmationRouter, GasOracleStatus, LoggingStatusSink, RollupStatus,
    RollupStatusSink, StatusUpdate,
};
