//! Remote engine backed by the published relayer SDK.
//!
//! Remote chains cannot be served in-process: ciphertext construction and
//! user decryption go through the relayer operated for the deployment. The
//! SDK artifact is fetched once per process and validated for the exports
//! the engine relies on before any instance is built.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fhes_common::types::{Address, ChainId};

use crate::error::{EngineError, Result};
use crate::instance::{
    CiphertextBundle, CiphertextHandle, ClearValue, EncryptedInput, EngineKind, FhevmDeployment,
    FhevmEngine, FhevmInstance, GrantKeypair, HandleContractPair, InstanceRequest,
    UserDecryptRequest,
};
use crate::materials::PublicMaterials;
use crate::metadata;

/// Exports a valid SDK artifact must carry.
pub const SDK_MARKERS: [&str; 3] = ["initSDK", "createInstance", "SepoliaConfig"];

// ═══════════════════════════════════════════════════════════════════════════════
// ARTIFACT LOADING
// ═══════════════════════════════════════════════════════════════════════════════

/// Fetches the SDK artifact bytes. Swappable in tests.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

/// A fetched and validated SDK artifact.
#[derive(Clone, Debug)]
pub struct RelayerSdk {
    artifact_len: usize,
    artifact_digest: [u8; 32],
}

impl RelayerSdk {
    pub fn artifact_len(&self) -> usize {
        self.artifact_len
    }

    pub fn artifact_digest_hex(&self) -> String {
        format!("0x{}", hex::encode(self.artifact_digest))
    }
}

/// Fetch the SDK artifact from `url` and validate its capability surface.
pub async fn load_relayer_sdk(fetcher: &dyn ArtifactFetcher, url: &str) -> Result<RelayerSdk> {
    tracing::info!("fetching relayer SDK artifact from {url}");
    let artifact = fetcher
        .fetch(url)
        .await
        .map_err(|e| EngineError::SdkLoadFailed(e.to_string()))?;
    validate_artifact(&artifact)?;
    let sdk = RelayerSdk {
        artifact_len: artifact.len(),
        artifact_digest: *blake3::hash(&artifact).as_bytes(),
    };
    tracing::info!(len = sdk.artifact_len, "relayer SDK artifact validated");
    Ok(sdk)
}

fn validate_artifact(artifact: &[u8]) -> Result<()> {
    if artifact.is_empty() {
        return Err(EngineError::SdkLoadFailed("artifact is empty".to_string()));
    }
    let text = String::from_utf8_lossy(artifact);
    for marker in SDK_MARKERS {
        if !text.contains(marker) {
            return Err(EngineError::SdkLoadFailed(format!(
                "artifact does not export `{marker}`"
            )));
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// RELAYER ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine bound to the published relayer deployment.
pub struct RelayerEngine {
    sdk: RelayerSdk,
    relayer_url: String,
    client: reqwest::Client,
    deployment: FhevmDeployment,
}

impl RelayerEngine {
    pub fn new(sdk: RelayerSdk, relayer_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Ok(Self {
            sdk,
            relayer_url: relayer_url.into().trim_end_matches('/').to_string(),
            client,
            deployment: metadata::fallback_deployment()?,
        })
    }

    pub fn sdk(&self) -> &RelayerSdk {
        &self.sdk
    }

    // === Private helpers ===

    async fn fetch_key_metadata(&self) -> Result<KeyUrlResponse> {
        let url = format!("{}/v1/keyurl", self.relayer_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }

    async fn fetch_blob(&self, blob: &RemoteBlobRef) -> Result<Vec<u8>> {
        let bytes = self
            .client
            .get(&blob.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        if bytes.len() as u64 != blob.size {
            return Err(EngineError::Instance(format!(
                "blob {} size mismatch: advertised {}, fetched {}",
                blob.data_id,
                blob.size,
                bytes.len()
            )));
        }
        Ok(bytes.to_vec())
    }

    /// Reuse seeded materials only when they match the advertised key set;
    /// anything else triggers a full fetch.
    async fn resolve_materials(&self, seeded: Option<PublicMaterials>) -> Result<PublicMaterials> {
        let advertised = self.fetch_key_metadata().await?;
        if let Some(materials) = seeded {
            if materials.public_key.len() as u64 == advertised.public_key.size
                && materials.public_params.len() as u64 == advertised.public_params.size
            {
                tracing::debug!("reusing cached public materials");
                return Ok(materials);
            }
            tracing::info!("cached public materials do not match the advertised key set");
        }
        let public_key = self.fetch_blob(&advertised.public_key).await?;
        let public_params = self.fetch_blob(&advertised.public_params).await?;
        Ok(PublicMaterials::new(public_key, public_params))
    }
}

#[async_trait]
impl FhevmEngine for RelayerEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Relayer
    }

    async fn deployment(&self, _chain_id: ChainId) -> Result<FhevmDeployment> {
        Ok(self.deployment.clone())
    }

    async fn create_instance(&self, request: InstanceRequest) -> Result<Arc<dyn FhevmInstance>> {
        let materials = self.resolve_materials(request.seeded_materials).await?;
        Ok(Arc::new(RelayerInstance {
            chain_id: request.chain_id,
            deployment: self.deployment.clone(),
            materials,
            relayer_url: self.relayer_url.clone(),
            client: self.client.clone(),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RELAYER INSTANCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Instance that delegates ciphertext work to the relayer's REST API.
pub struct RelayerInstance {
    chain_id: ChainId,
    deployment: FhevmDeployment,
    materials: PublicMaterials,
    relayer_url: String,
    client: reqwest::Client,
}

#[async_trait]
impl FhevmInstance for RelayerInstance {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn deployment(&self) -> &FhevmDeployment {
        &self.deployment
    }

    fn public_materials(&self) -> PublicMaterials {
        self.materials.clone()
    }

    /// Submits the cleartext values to the relayer's input endpoint, which
    /// returns the registered handles and the input proof.
    async fn encrypt_input(&self, input: &EncryptedInput) -> Result<CiphertextBundle> {
        if input.is_empty() {
            return Err(EngineError::Instance(
                "encrypted input has no values".to_string(),
            ));
        }
        let url = format!("{}/v1/input-proof", self.relayer_url);
        let request = InputProofHttpRequest {
            contract_address: input.contract_address(),
            user_address: input.user_address(),
            contracts_chain_id: self.chain_id.as_u64(),
            values: input.values(),
        };
        let response: InputProofHttpResponse = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.handles.len() != input.values().len() {
            return Err(EngineError::Instance(format!(
                "relayer returned {} handles for {} values",
                response.handles.len(),
                input.values().len()
            )));
        }
        Ok(CiphertextBundle {
            handles: response.handles,
            input_proof: response.input_proof,
        })
    }

    fn generate_keypair(&self) -> GrantKeypair {
        GrantKeypair::generate()
    }

    async fn user_decrypt(
        &self,
        request: &UserDecryptRequest,
    ) -> Result<HashMap<CiphertextHandle, ClearValue>> {
        let url = format!("{}/v1/user-decrypt", self.relayer_url);
        let http_request = UserDecryptHttpRequest {
            handle_contract_pairs: &request.pairs,
            request_validity: RequestValidity {
                start_timestamp: request.start_timestamp.to_string(),
                duration_days: request.duration_days.to_string(),
            },
            contracts_chain_id: self.chain_id.as_u64(),
            contract_addresses: &request.contract_addresses,
            user_address: &request.user_address,
            signature: &request.signature,
            public_key: &request.keypair.public_key,
        };
        let response: UserDecryptHttpResponse = self
            .client
            .post(&url)
            .json(&http_request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut out = HashMap::with_capacity(response.results.len());
        for item in response.results {
            out.insert(item.handle, item.value);
        }
        for pair in &request.pairs {
            if !out.contains_key(&pair.handle) {
                return Err(EngineError::Instance(format!(
                    "relayer response is missing handle {}",
                    pair.handle
                )));
            }
        }
        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WIRE TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Key-set advertisement from `GET /v1/keyurl`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyUrlResponse {
    public_key: RemoteBlobRef,
    public_params: RemoteBlobRef,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteBlobRef {
    data_id: String,
    url: String,
    size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InputProofHttpRequest<'a> {
    contract_address: &'a Address,
    user_address: &'a Address,
    contracts_chain_id: u64,
    values: &'a [ClearValue],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputProofHttpResponse {
    handles: Vec<CiphertextHandle>,
    #[serde(with = "crate::materials::hex_blob")]
    input_proof: Vec<u8>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserDecryptHttpRequest<'a> {
    handle_contract_pairs: &'a [HandleContractPair],
    request_validity: RequestValidity,
    contracts_chain_id: u64,
    contract_addresses: &'a [Address],
    user_address: &'a Address,
    signature: &'a str,
    public_key: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestValidity {
    start_timestamp: String,
    duration_days: String,
}

#[derive(Debug, Deserialize)]
struct UserDecryptHttpResponse {
    results: Vec<DecryptedValue>,
}

#[derive(Debug, Deserialize)]
struct DecryptedValue {
    handle: CiphertextHandle,
    value: ClearValue,
}
