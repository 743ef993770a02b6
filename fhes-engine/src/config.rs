//! Engine configuration.
//!
//! One config drives both acquisition paths: chains listed in
//! [`EngineConfig::mock_chains`] get the in-process mock engine, everything
//! else goes through the remote relayer SDK.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use fhes_common::types::ChainId;

use crate::error::{EngineError, Result};

/// Published location of the relayer SDK artifact.
pub const RELAYER_SDK_URL: &str =
    "https://cdn.zama.ai/relayer-sdk-js/0.1.0-9/relayer-sdk-js.umd.cjs";

/// Default relayer REST endpoint for remote chains.
pub const DEFAULT_RELAYER_URL: &str = "https://relayer.testnet.zama.cloud";

/// Configuration for engine acquisition and instance creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Chains served by the in-process mock engine, keyed by chain id, each
    /// with the JSON-RPC endpoint used for deployment metadata queries.
    #[serde(default = "default_mock_chains")]
    pub mock_chains: HashMap<u64, String>,

    /// Where the remote encryption SDK artifact is fetched from.
    #[serde(default = "default_sdk_url")]
    pub sdk_url: String,

    /// Relayer REST endpoint remote instances talk to.
    #[serde(default = "default_relayer_url")]
    pub relayer_url: String,

    /// Validity window stamped into newly created decryption grants.
    #[serde(default = "default_grant_validity_days")]
    pub grant_validity_days: u64,

    /// Timeout for relayer and metadata HTTP calls, in seconds.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_mock_chains() -> HashMap<u64, String> {
    HashMap::from([(31337, "http://localhost:8545".to_string())])
}

fn default_sdk_url() -> String {
    RELAYER_SDK_URL.to_string()
}

fn default_relayer_url() -> String {
    DEFAULT_RELAYER_URL.to_string()
}

fn default_grant_validity_days() -> u64 {
    365
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mock_chains: default_mock_chains(),
            sdk_url: default_sdk_url(),
            relayer_url: default_relayer_url(),
            grant_validity_days: default_grant_validity_days(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// Route `chain_id` to the mock engine backed by `rpc_url`.
    pub fn with_mock_chain(mut self, chain_id: u64, rpc_url: impl Into<String>) -> Self {
        self.mock_chains.insert(chain_id, rpc_url.into());
        self
    }

    pub fn with_relayer_url(mut self, url: impl Into<String>) -> Self {
        self.relayer_url = url.into();
        self
    }

    pub fn with_sdk_url(mut self, url: impl Into<String>) -> Self {
        self.sdk_url = url.into();
        self
    }

    pub fn with_grant_validity_days(mut self, days: u64) -> Self {
        self.grant_validity_days = days;
        self
    }

    /// Whether `chain_id` is served by the in-process mock engine.
    pub fn is_mock_chain(&self, chain_id: ChainId) -> bool {
        self.mock_chains.contains_key(&chain_id.as_u64())
    }

    /// JSON-RPC endpoint for a mock chain, if configured.
    pub fn mock_rpc_url(&self, chain_id: ChainId) -> Option<&str> {
        self.mock_chains.get(&chain_id.as_u64()).map(String::as_str)
    }

    /// Reject configurations that cannot work before any network calls.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.sdk_url)
            .map_err(|e| EngineError::Config(format!("sdk_url `{}`: {e}", self.sdk_url)))?;
        Url::parse(&self.relayer_url)
            .map_err(|e| EngineError::Config(format!("relayer_url `{}`: {e}", self.relayer_url)))?;
        for (chain_id, rpc_url) in &self.mock_chains {
            Url::parse(rpc_url).map_err(|e| {
                EngineError::Config(format!("mock chain {chain_id} rpc url `{rpc_url}`: {e}"))
            })?;
        }
        if self.grant_validity_days == 0 {
            return Err(EngineError::Config(
                "grant_validity_days must be at least 1".to_string(),
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(EngineError::Config(
                "http_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_the_local_hardhat_chain() {
        let config = EngineConfig::default();
        assert!(config.is_mock_chain(ChainId(31337)));
        assert_eq!(
            config.mock_rpc_url(ChainId(31337)),
            Some("http://localhost:8545")
        );
        assert!(!config.is_mock_chain(ChainId(11155111)));
        config.validate().unwrap();
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.sdk_url, RELAYER_SDK_URL);
        assert_eq!(config.relayer_url, DEFAULT_RELAYER_URL);
        assert_eq!(config.grant_validity_days, 365);
    }

    #[test]
    fn validate_rejects_malformed_urls() {
        let config = EngineConfig::default().with_relayer_url("not a url");
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig::default().with_mock_chain(1234, "also not a url");
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_validity() {
        let config = EngineConfig::default().with_grant_validity_days(0);
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }
}
