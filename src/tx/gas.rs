//! Fee estimation and gas price escalation for legacy and dynamic-fee transactions

use crate::chain::{CallMsg, ChainClient, GasPrice};
use crate::error::{SenderError, SenderResult};
use crate::types::TxType;

use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Fees and gas limit for one transaction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeData {
    pub gas_price: GasPrice,
    pub gas_limit: u64,
}

/// Gas estimator for transactions
pub struct FeeEstimator {
    client: Arc<dyn ChainClient>,
    tx_type: TxType,
    /// Floor for the suggested gas price or tip
    min_gas_tip: U256,
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
}

impl FeeEstimator {
    /// Create a new gas estimator
    pub fn new(client: Arc<dyn ChainClient>, tx_type: TxType, min_gas_tip: u64) -> Self {
        Self {
            client,
            tx_type,
            min_gas_tip: U256::from(min_gas_tip),
            gas_limit_buffer_percent: 20,
        }
    }

    /// Estimate fees for a transaction.
    ///
    /// `base_fee` is the last observed base fee and is only used by the
    /// dynamic-fee path. A failed dry-run falls back to `fallback_gas_limit`
    /// when it is non-zero and is returned as an error otherwise.
    pub async fn estimate(
        &self,
        from: Address,
        to: Option<Address>,
        value: U256,
        data: &Bytes,
        base_fee: U256,
        fallback_gas_limit: u64,
    ) -> SenderResult<FeeData> {
        match self.tx_type {
            TxType::DynamicFee => {
                self.estimate_dynamic(from, to, value, data, base_fee, fallback_gas_limit)
                    .await
            }
            TxType::Legacy | TxType::AccessList => {
                self.estimate_legacy(from, to, value, data, fallback_gas_limit)
                    .await
            }
        }
    }

    async fn estimate_legacy(
        &self,
        from: Address,
        to: Option<Address>,
        value: U256,
        data: &Bytes,
        fallback_gas_limit: u64,
    ) -> SenderResult<FeeData> {
        let suggested = self.client.suggest_gas_price().await.map_err(|e| {
            error!(error = %e, "Failed to fetch suggested gas price");
            e
        })?;
        let gas_price = suggested.max(self.min_gas_tip);

        let msg = CallMsg {
            from,
            to,
            value,
            data: data.clone(),
            gas_price: Some(gas_price),
            ..Default::default()
        };
        let gas_limit = self.estimate_gas_limit(&msg, fallback_gas_limit).await?;

        Ok(FeeData {
            gas_price: GasPrice::Legacy(gas_price),
            gas_limit,
        })
    }

    async fn estimate_dynamic(
        &self,
        from: Address,
        to: Option<Address>,
        value: U256,
        data: &Bytes,
        base_fee: U256,
        fallback_gas_limit: u64,
    ) -> SenderResult<FeeData> {
        let suggested = self.client.suggest_gas_tip_cap().await.map_err(|e| {
            error!(error = %e, "Failed to fetch suggested gas tip cap");
            e
        })?;
        let gas_tip_cap = suggested.max(self.min_gas_tip);
        let gas_fee_cap = gas_fee_cap(base_fee, gas_tip_cap);

        let msg = CallMsg {
            from,
            to,
            value,
            data: data.clone(),
            gas_tip_cap: Some(gas_tip_cap),
            gas_fee_cap: Some(gas_fee_cap),
            ..Default::default()
        };
        let gas_limit = self.estimate_gas_limit(&msg, fallback_gas_limit).await?;

        Ok(FeeData {
            gas_price: GasPrice::Eip1559 {
                max_fee_per_gas: gas_fee_cap,
                max_priority_fee_per_gas: gas_tip_cap,
            },
            gas_limit,
        })
    }

    async fn estimate_gas_limit(
        &self,
        msg: &CallMsg,
        fallback_gas_limit: u64,
    ) -> SenderResult<u64> {
        match self.client.estimate_gas(msg).await {
            Ok(estimated) => {
                let buffer = estimated * self.gas_limit_buffer_percent / 100;
                debug!(estimated, padded = estimated + buffer, "Estimated gas limit");
                Ok(estimated + buffer)
            }
            Err(e) if fallback_gas_limit > 0 => {
                warn!(
                    error = %e,
                    fallback_gas_limit,
                    from = ?msg.from,
                    to = ?msg.to,
                    "Gas estimation failed, using fallback gas limit"
                );
                Ok(fallback_gas_limit)
            }
            Err(e) => {
                error!(error = %e, from = ?msg.from, to = ?msg.to, "Gas estimation failed");
                Err(SenderError::GasEstimation(e.to_string()))
            }
        }
    }
}

/// Fee cap for a fresh dynamic-fee transaction: `tip + 2 * base_fee`
pub fn gas_fee_cap(base_fee: U256, gas_tip_cap: U256) -> U256 {
    base_fee.saturating_mul(U256::from(2)).saturating_add(gas_tip_cap)
}

/// Fee bumping for stuck transactions
#[derive(Debug, Clone, Copy)]
pub struct Escalator {
    numerator: U256,
    denominator: U256,
    max_gas_price: U256,
}

impl Escalator {
    /// Create an escalator bumping fees by `numerator / denominator`
    pub fn new(numerator: u64, denominator: u64, max_gas_price: u64) -> SenderResult<Self> {
        if numerator <= denominator || denominator == 0 {
            return Err(SenderError::Config(format!(
                "invalid escalation ratio: escalate_multiple_num ({}) must be greater than escalate_multiple_den ({})",
                numerator, denominator
            )));
        }

        Ok(Self {
            numerator: U256::from(numerator),
            denominator: U256::from(denominator),
            max_gas_price: U256::from(max_gas_price),
        })
    }

    fn bump(&self, value: U256) -> U256 {
        value.saturating_mul(self.numerator) / self.denominator
    }

    /// Compute the fees of a replacement transaction.
    ///
    /// Every bumped field strictly increases so nodes never reject the
    /// replacement as underpriced, even when the ratio rounds to no change.
    pub fn escalate(&self, current: &GasPrice, base_fee: U256) -> GasPrice {
        match current {
            GasPrice::Legacy(original) => {
                let mut price = self.bump(*original).min(self.max_gas_price);
                if price == *original {
                    warn!(original = %original, "Gas price bump corner case, adding 1 wei");
                    price += U256::one();
                }
                debug!(original = %original, adjusted = %price, "Escalated legacy gas price");
                GasPrice::Legacy(price)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas: original_fee_cap,
                max_priority_fee_per_gas: original_tip_cap,
            } => {
                let mut tip_cap = self.bump(*original_tip_cap);
                let mut fee_cap = self.bump(*original_fee_cap);

                // anticipate a rising base fee
                let adjusted_base_fee = self.bump(base_fee);
                fee_cap = fee_cap.max(tip_cap.saturating_add(adjusted_base_fee));

                fee_cap = fee_cap.min(self.max_gas_price);
                tip_cap = tip_cap.min(fee_cap);

                if tip_cap == *original_tip_cap {
                    warn!(
                        original = %original_tip_cap,
                        "Gas tip cap bump corner case, adding 1 wei"
                    );
                    tip_cap += U256::one();
                }
                if fee_cap == *original_fee_cap {
                    warn!(
                        original = %original_fee_cap,
                        "Gas fee cap bump corner case, adding 1 wei"
                    );
                    fee_cap += U256::one();
                }

                debug!(
                    original_tip_cap = %original_tip_cap,
                    adjusted_tip_cap = %tip_cap,
                    original_fee_cap = %original_fee_cap,
                    adjusted_fee_cap = %fee_cap,
                    "Escalated dynamic fee caps"
                );

                GasPrice::Eip1559 {
                    max_fee_per_gas: fee_cap,
                    max_priority_fee_per_gas: tip_cap,
                }
            }
        }
    }
}
