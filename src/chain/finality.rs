//! Confirmation depth resolution
//!
//! A receipt is final once its block is at or below the latest confirmed block:
//! - `finalized` / `safe`: the number of the tagged header
//! - `latest`: the head itself
//! - a depth `N`: `head - N`, saturating at genesis

use super::{BlockTag, ChainClient};
use crate::config::Confirmations;
use crate::error::SenderResult;

use tracing::debug;

/// Resolve the highest block number considered confirmed
pub async fn latest_confirmed_block_number(
    client: &dyn ChainClient,
    confirmations: Confirmations,
) -> SenderResult<u64> {
    let confirmed = match confirmations {
        Confirmations::Finalized => client.header_by_number(BlockTag::Finalized).await?.number,
        Confirmations::Safe => client.header_by_number(BlockTag::Safe).await?.number,
        Confirmations::Latest => client.header_by_number(BlockTag::Latest).await?.number,
        Confirmations::Depth(depth) => {
            let head = client.header_by_number(BlockTag::Latest).await?.number;
            head.saturating_sub(depth)
        }
    };

    debug!(?confirmations, confirmed, "Resolved latest confirmed block");
    Ok(confirmed)
}
