//! Configuration management for the rollup sender
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{SenderError, SenderResult};
use crate::types::{SenderType, TxType};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
    pub senders: HashMap<String, SenderSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// One sender instance: which account signs and what it sends
#[derive(Debug, Clone, Deserialize)]
pub struct SenderSettings {
    pub enabled: bool,
    pub service: String,
    pub sender_type: SenderType,
    pub sender: SenderConfig,
    pub signer: SignerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    /// RPC endpoint of the target chain node
    pub endpoint: String,
    /// Seconds between two pending-transaction checks
    pub check_pending_time_secs: u64,
    /// Blocks to wait before a pending transaction is resubmitted with a higher fee
    pub escalate_blocks: u64,
    /// How deep a receipt must be before it counts as confirmed
    pub confirmations: Confirmations,
    pub escalate_multiple_num: u64,
    pub escalate_multiple_den: u64,
    /// Hard ceiling for gas price / fee cap, in wei
    pub max_gas_price: u64,
    /// Floor for the suggested gas price (legacy) or tip (dynamic fee), in wei
    #[serde(default)]
    pub min_gas_tip: u64,
    pub tx_type: TxType,
    /// Maximum number of pending transactions for this sender type; 0 disables the limit
    #[serde(default)]
    pub pending_limit: u64,
}

impl SenderConfig {
    /// Validate escalation parameters
    pub fn validate(&self) -> SenderResult<()> {
        if self.escalate_multiple_num <= self.escalate_multiple_den {
            return Err(SenderError::Config(format!(
                "invalid escalation ratio: escalate_multiple_num ({}) must be greater than escalate_multiple_den ({})",
                self.escalate_multiple_num, self.escalate_multiple_den
            )));
        }
        if self.escalate_multiple_den == 0 {
            return Err(SenderError::Config(
                "escalate_multiple_den must be non-zero".to_string(),
            ));
        }
        if self.check_pending_time_secs == 0 {
            return Err(SenderError::Config(
                "check_pending_time_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Confirmation depth: a block tag, or a number of blocks behind the head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ConfirmationsRepr")]
pub enum Confirmations {
    Finalized,
    Safe,
    Latest,
    Depth(u64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfirmationsRepr {
    Depth(u64),
    Tag(String),
}

impl TryFrom<ConfirmationsRepr> for Confirmations {
    type Error = String;

    fn try_from(value: ConfirmationsRepr) -> Result<Self, Self::Error> {
        match value {
            ConfirmationsRepr::Depth(depth) => Ok(Confirmations::Depth(depth)),
            ConfirmationsRepr::Tag(tag) => match tag.as_str() {
                "finalized" => Ok(Confirmations::Finalized),
                "safe" => Ok(Confirmations::Safe),
                "latest" => Ok(Confirmations::Latest),
                other => Err(format!("invalid confirmations value: {}", other)),
            },
        }
    }
}

/// Signing backend for a sender account
#[derive(Clone, Deserialize)]
#[serde(tag = "signer_type")]
pub enum SignerConfig {
    PrivateKey {
        private_key: String,
    },
    RemoteSigner {
        signer_address: String,
        remote_signer_url: String,
    },
}

impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerConfig::PrivateKey { .. } => f
                .debug_struct("PrivateKey")
                .field("private_key", &"<redacted>")
                .finish(),
            SignerConfig::RemoteSigner {
                signer_address,
                remote_signer_url,
            } => f
                .debug_struct("RemoteSigner")
                .field("signer_address", signer_address)
                .field("remote_signer_url", remote_signer_url)
                .finish(),
        }
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("ROLLUP_SENDER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_senders().is_empty() {
            anyhow::bail!("At least one sender must be enabled");
        }

        for (name, sender) in self.enabled_senders() {
            if sender.sender.endpoint.is_empty() {
                anyhow::bail!("Sender {} has no endpoint configured", name);
            }
            sender
                .sender
                .validate()
                .with_context(|| format!("Invalid sender config for {}", name))?;
        }

        Ok(())
    }

    /// Get list of enabled senders
    pub fn enabled_senders(&self) -> Vec<(&String, &SenderSettings)> {
        self.senders.iter().filter(|(_, s)| s.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
