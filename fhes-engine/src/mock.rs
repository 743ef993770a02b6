//! In-process engine for development chains.
//!
//! Nothing here is cryptographic: handles are tagged keccak digests, the
//! input proof is a blake3 digest, and decryption reads back a per-engine
//! cleartext oracle populated at encryption time. The surface matches the
//! remote engine exactly, so session code cannot tell the two apart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use tokio::sync::RwLock;

use fhes_common::types::{Address, ChainId};

use crate::error::{EngineError, Result};
use crate::instance::{
    CiphertextBundle, CiphertextHandle, ClearValue, EncryptedInput, EngineKind, FhevmDeployment,
    FhevmEngine, FhevmInstance, GrantKeypair, InstanceRequest, UserDecryptRequest,
};
use crate::materials::PublicMaterials;
use crate::metadata::{self, ChainRpc, HttpChainRpc};

/// Cleartexts indexed by handle, shared by every instance of one engine.
type CleartextOracle = RwLock<HashMap<CiphertextHandle, ClearValue>>;

// ═══════════════════════════════════════════════════════════════════════════════
// MOCK ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine for one development chain, discovered over its JSON-RPC node.
pub struct MockEngine {
    chain_id: ChainId,
    rpc: Arc<dyn ChainRpc>,
    oracle: Arc<CleartextOracle>,
}

impl MockEngine {
    pub fn new(chain_id: ChainId, rpc_url: impl Into<String>, timeout: Duration) -> Self {
        Self::with_rpc(chain_id, Arc::new(HttpChainRpc::new(rpc_url, timeout)))
    }

    pub fn with_rpc(chain_id: ChainId, rpc: Arc<dyn ChainRpc>) -> Self {
        Self {
            chain_id,
            rpc,
            oracle: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Deployment as the node reports it, with the gateway domain read from
    /// the input verifier. The domain query has its own fallback so a node
    /// with metadata but no ERC-5267 verifier still resolves.
    async fn resolve_deployment(&self) -> Result<FhevmDeployment> {
        let meta = metadata::fetch_relayer_metadata(self.rpc.as_ref()).await?;
        let (gateway_chain_id, verifying_contract_input_verification) =
            match metadata::fetch_gateway_domain(self.rpc.as_ref(), &meta.input_verifier_address)
                .await
            {
                Ok(domain) => (domain.chain_id, domain.verifying_contract),
                Err(e) => {
                    tracing::warn!("input verifier domain query failed, using defaults: {e}");
                    (
                        metadata::defaults::GATEWAY_CHAIN_ID,
                        Address::parse(metadata::defaults::VERIFYING_CONTRACT_INPUT_VERIFICATION)?,
                    )
                }
            };
        Ok(FhevmDeployment {
            acl_address: meta.acl_address,
            kms_verifier_address: meta.kms_verifier_address,
            input_verifier_address: meta.input_verifier_address,
            gateway_chain_id,
            verifying_contract_decryption: Address::parse(
                metadata::defaults::VERIFYING_CONTRACT_DECRYPTION,
            )?,
            verifying_contract_input_verification,
        })
    }
}

#[async_trait]
impl FhevmEngine for MockEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Mock
    }

    async fn deployment(&self, _chain_id: ChainId) -> Result<FhevmDeployment> {
        match self.resolve_deployment().await {
            Ok(deployment) => Ok(deployment),
            Err(e) => {
                tracing::warn!(
                    chain = %self.chain_id,
                    "metadata query failed, using fallback deployment: {e}"
                );
                metadata::fallback_deployment()
            }
        }
    }

    async fn create_instance(&self, request: InstanceRequest) -> Result<Arc<dyn FhevmInstance>> {
        if request.chain_id != self.chain_id {
            return Err(EngineError::Instance(format!(
                "mock engine for chain {} asked to build for chain {}",
                self.chain_id, request.chain_id
            )));
        }
        let deployment = self.deployment(request.chain_id).await?;
        // Materials are synthesized, never fetched; any cache seed is ignored.
        Ok(Arc::new(MockFhevmInstance {
            chain_id: self.chain_id,
            deployment,
            materials: synthetic_materials(self.chain_id),
            oracle: Arc::clone(&self.oracle),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MOCK INSTANCE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct MockFhevmInstance {
    chain_id: ChainId,
    deployment: FhevmDeployment,
    materials: PublicMaterials,
    oracle: Arc<CleartextOracle>,
}

#[async_trait]
impl FhevmInstance for MockFhevmInstance {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn deployment(&self) -> &FhevmDeployment {
        &self.deployment
    }

    fn public_materials(&self) -> PublicMaterials {
        self.materials.clone()
    }

    async fn encrypt_input(&self, input: &EncryptedInput) -> Result<CiphertextBundle> {
        if input.is_empty() {
            return Err(EngineError::Instance(
                "encrypted input has no values".to_string(),
            ));
        }
        let handles: Vec<CiphertextHandle> = input
            .values()
            .iter()
            .enumerate()
            .map(|(index, value)| {
                mock_handle(input.contract_address(), input.user_address(), index, value)
            })
            .collect();

        let mut oracle = self.oracle.write().await;
        for (handle, value) in handles.iter().zip(input.values()) {
            oracle.insert(*handle, value.clone());
        }
        drop(oracle);

        Ok(CiphertextBundle {
            input_proof: mock_input_proof(&handles),
            handles,
        })
    }

    fn generate_keypair(&self) -> GrantKeypair {
        GrantKeypair::generate()
    }

    async fn user_decrypt(
        &self,
        request: &UserDecryptRequest,
    ) -> Result<HashMap<CiphertextHandle, ClearValue>> {
        if request.signature.is_empty() {
            return Err(EngineError::Instance(
                "decryption request carries no signature".to_string(),
            ));
        }
        for pair in &request.pairs {
            if !request.contract_addresses.contains(&pair.contract_address) {
                return Err(EngineError::Instance(format!(
                    "handle {} is outside the granted contract scope",
                    pair.handle
                )));
            }
        }

        let oracle = self.oracle.read().await;
        let mut out = HashMap::with_capacity(request.pairs.len());
        for pair in &request.pairs {
            let value = oracle.get(&pair.handle).ok_or_else(|| {
                EngineError::Instance(format!("unknown ciphertext handle {}", pair.handle))
            })?;
            out.insert(pair.handle, value.clone());
        }
        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Deterministic handle so repeated encryptions of the same input are stable.
fn mock_handle(
    contract: &Address,
    user: &Address,
    index: usize,
    value: &ClearValue,
) -> CiphertextHandle {
    let mut hasher = Keccak256::new();
    hasher.update(b"fhes_mock_handle_v1");
    hasher.update(contract.to_bytes());
    hasher.update(user.to_bytes());
    hasher.update((index as u32).to_be_bytes());
    hasher.update([value.fhe_type()]);
    hasher.update(value.to_bytes());
    CiphertextHandle::new(hasher.finalize().into())
}

fn mock_input_proof(handles: &[CiphertextHandle]) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"fhes_mock_input_proof_v1");
    for handle in handles {
        hasher.update(handle.as_bytes());
    }
    hasher.finalize().as_bytes().to_vec()
}

fn synthetic_materials(chain_id: ChainId) -> PublicMaterials {
    PublicMaterials::new(
        tagged_blob(b"fhes_mock_public_key_v1", chain_id),
        tagged_blob(b"fhes_mock_public_params_v1", chain_id),
    )
}

fn tagged_blob(tag: &[u8], chain_id: ChainId) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag);
    hasher.update(&chain_id.as_u64().to_be_bytes());
    hasher.finalize().as_bytes().to_vec()
}
