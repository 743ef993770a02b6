//! Deployment metadata discovery over chain JSON-RPC.
//!
//! Development nodes expose `fhevm_relayer_metadata`, which returns the host
//! contract addresses of their local FHEVM deployment. The gateway domain is
//! then read from the input verifier through ERC-5267 `eip712Domain()`.
//! Every query has a hard-coded fallback so a node without the extension
//! still yields a usable deployment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use fhes_common::types::Address;

use crate::error::{EngineError, Result};
use crate::instance::FhevmDeployment;

/// Well-known values applied when a discovery query is unavailable.
pub mod defaults {
    /// FHEVM host contracts of the reference deployment.
    pub const ACL_ADDRESS: &str = "0x687820221192C5B662b25367F70076A37bc79b6c";
    pub const KMS_VERIFIER_ADDRESS: &str = "0x1364cBBf2cDF5032C47d8226a6f6FBD2AFCDacAC";
    pub const INPUT_VERIFIER_ADDRESS: &str = "0xbc91f3daD1A5F19F8390c400196e58073B6a0BC4";

    /// Chain the decryption gateway runs on.
    pub const GATEWAY_CHAIN_ID: u64 = 55815;
    pub const VERIFYING_CONTRACT_DECRYPTION: &str = "0x5ffdaAB0373E62E2ea2944776209aEf29E631A64";
    pub const VERIFYING_CONTRACT_INPUT_VERIFICATION: &str =
        "0x812b06e1CDCE800494b79fFE4f925A504a9A9810";
}

/// ERC-5267 `eip712Domain()` selector.
const EIP712_DOMAIN_SELECTOR: &str = "0x84b0196e";

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN RPC
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimal JSON-RPC channel to a chain node.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

/// JSON-RPC 2.0 over HTTP.
pub struct HttpChainRpc {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpChainRpc {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        let response: Value = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.get("error") {
            return Err(EngineError::MetadataQueryFailed(format!(
                "{method} returned an error: {error}"
            )));
        }
        response.get("result").cloned().ok_or_else(|| {
            EngineError::MetadataQueryFailed(format!("{method} returned no result"))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISCOVERY QUERIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Result shape of `fhevm_relayer_metadata`.
#[derive(Clone, Debug, Deserialize)]
pub struct RelayerMetadata {
    #[serde(rename = "ACLAddress")]
    pub acl_address: Address,
    #[serde(rename = "InputVerifierAddress")]
    pub input_verifier_address: Address,
    #[serde(rename = "KMSVerifierAddress")]
    pub kms_verifier_address: Address,
}

/// Ask the node for its FHEVM host contract addresses.
pub async fn fetch_relayer_metadata(rpc: &dyn ChainRpc) -> Result<RelayerMetadata> {
    let result = rpc.call("fhevm_relayer_metadata", json!([])).await?;
    serde_json::from_value(result)
        .map_err(|e| EngineError::MetadataQueryFailed(format!("malformed relayer metadata: {e}")))
}

/// Gateway domain advertised by a verifier contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayDomain {
    pub chain_id: u64,
    pub verifying_contract: Address,
}

/// Read the ERC-5267 domain of `verifier` over `eth_call`.
///
/// The return data packs `(fields, name, version, chainId,
/// verifyingContract, salt, extensions)`; only words 3 and 4 matter here.
pub async fn fetch_gateway_domain(rpc: &dyn ChainRpc, verifier: &Address) -> Result<GatewayDomain> {
    let params = json!([
        { "to": verifier.as_str(), "data": EIP712_DOMAIN_SELECTOR },
        "latest",
    ]);
    let result = rpc.call("eth_call", params).await?;
    let raw = result.as_str().ok_or_else(|| {
        EngineError::MetadataQueryFailed("eip712Domain call returned no data".to_string())
    })?;
    decode_domain_words(raw)
}

/// Deployment assembled entirely from [`defaults`].
pub fn fallback_deployment() -> Result<FhevmDeployment> {
    Ok(FhevmDeployment {
        acl_address: Address::parse(defaults::ACL_ADDRESS)?,
        kms_verifier_address: Address::parse(defaults::KMS_VERIFIER_ADDRESS)?,
        input_verifier_address: Address::parse(defaults::INPUT_VERIFIER_ADDRESS)?,
        gateway_chain_id: defaults::GATEWAY_CHAIN_ID,
        verifying_contract_decryption: Address::parse(defaults::VERIFYING_CONTRACT_DECRYPTION)?,
        verifying_contract_input_verification: Address::parse(
            defaults::VERIFYING_CONTRACT_INPUT_VERIFICATION,
        )?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

fn decode_domain_words(raw: &str) -> Result<GatewayDomain> {
    let body = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(body).map_err(|e| {
        EngineError::MetadataQueryFailed(format!("eip712Domain returned bad hex: {e}"))
    })?;

    let chain_word = abi_word(&bytes, 3)?;
    if chain_word[..24].iter().any(|b| *b != 0) {
        return Err(EngineError::MetadataQueryFailed(
            "gateway chain id exceeds u64".to_string(),
        ));
    }
    let mut chain_id: u64 = 0;
    for b in &chain_word[24..] {
        chain_id = (chain_id << 8) | u64::from(*b);
    }

    let contract_word = abi_word(&bytes, 4)?;
    let verifying_contract = Address::parse(&format!("0x{}", hex::encode(&contract_word[12..])))?;

    Ok(GatewayDomain {
        chain_id,
        verifying_contract,
    })
}

fn abi_word(bytes: &[u8], index: usize) -> Result<&[u8]> {
    let start = index * 32;
    let end = start + 32;
    if bytes.len() < end {
        return Err(EngineError::MetadataQueryFailed(format!(
            "eip712Domain return data too short for word {index}"
        )));
    }
    Ok(&bytes[start..end])
}
