//! Engine and instance capability surfaces.
//!
//! An engine is a factory acquired once per process (remote) or per chain
//! (mock); an instance is what sessions actually encrypt and decrypt
//! through, bound to one chain and one deployment. Everything above these
//! traits is backend-agnostic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use fhes_common::types::{Address, ChainId};

use crate::eip712::{self, Eip712Domain};
use crate::error::{EngineError, Result};
use crate::materials::PublicMaterials;

// ═══════════════════════════════════════════════════════════════════════════════
// DEPLOYMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Which acquisition path produced an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineKind {
    /// In-process engine for development chains.
    Mock,
    /// Remote relayer SDK engine.
    Relayer,
}

/// Host-chain and gateway contracts of one FHEVM deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FhevmDeployment {
    pub acl_address: Address,
    pub kms_verifier_address: Address,
    pub input_verifier_address: Address,
    /// Chain the decryption gateway runs on.
    pub gateway_chain_id: u64,
    pub verifying_contract_decryption: Address,
    pub verifying_contract_input_verification: Address,
}

impl FhevmDeployment {
    /// Domain user decryption signatures are verified under.
    pub fn decryption_domain(&self) -> Eip712Domain {
        Eip712Domain {
            chain_id: self.gateway_chain_id,
            verifying_contract: self.verifying_contract_decryption.clone(),
        }
    }
}

/// Inputs to one instance creation attempt.
#[derive(Clone, Debug)]
pub struct InstanceRequest {
    pub chain_id: ChainId,
    /// Previously cached materials, if the caller found any. Engines
    /// validate these against the live deployment before using them.
    pub seeded_materials: Option<PublicMaterials>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// VALUES AND HANDLES
// ═══════════════════════════════════════════════════════════════════════════════

/// A cleartext value accepted by the encrypted input builder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ClearValue {
    Bool(bool),
    Uint32(u32),
    Uint64(u64),
    Address(Address),
}

impl ClearValue {
    /// On-chain FHE type discriminant for this value.
    pub fn fhe_type(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Uint32(_) => 4,
            Self::Uint64(_) => 5,
            Self::Address(_) => 7,
        }
    }

    /// Big-endian byte rendering used for handle derivation.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bool(v) => vec![u8::from(*v)],
            Self::Uint32(v) => v.to_be_bytes().to_vec(),
            Self::Uint64(v) => v.to_be_bytes().to_vec(),
            Self::Address(v) => v.to_bytes().to_vec(),
        }
    }
}

/// A 32-byte handle referencing one ciphertext on chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CiphertextHandle([u8; 32]);

impl CiphertextHandle {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let body = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(body)
            .map_err(|_| EngineError::Instance(format!("malformed ciphertext handle: {s}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EngineError::Instance(format!("ciphertext handle is not 32 bytes: {s}")))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for CiphertextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CiphertextHandle({})", self.to_hex())
    }
}

impl std::fmt::Display for CiphertextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for CiphertextHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CiphertextHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Output of one encrypted input submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiphertextBundle {
    /// One handle per builder value, in insertion order.
    pub handles: Vec<CiphertextHandle>,
    /// Proof binding the handles to the contract and user.
    #[serde(with = "crate::materials::hex_blob")]
    pub input_proof: Vec<u8>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENCRYPTED INPUT BUILDER
// ═══════════════════════════════════════════════════════════════════════════════

/// Accumulates cleartext values for one contract-bound encryption call.
#[derive(Clone, Debug)]
pub struct EncryptedInput {
    contract_address: Address,
    user_address: Address,
    values: Vec<ClearValue>,
}

impl EncryptedInput {
    pub fn new(contract_address: Address, user_address: Address) -> Self {
        Self {
            contract_address,
            user_address,
            values: Vec::new(),
        }
    }

    pub fn add_bool(mut self, value: bool) -> Self {
        self.values.push(ClearValue::Bool(value));
        self
    }

    pub fn add32(mut self, value: u32) -> Self {
        self.values.push(ClearValue::Uint32(value));
        self
    }

    pub fn add64(mut self, value: u64) -> Self {
        self.values.push(ClearValue::Uint64(value));
        self
    }

    pub fn add_address(mut self, value: Address) -> Self {
        self.values.push(ClearValue::Address(value));
        self
    }

    pub fn contract_address(&self) -> &Address {
        &self.contract_address
    }

    pub fn user_address(&self) -> &Address {
        &self.user_address
    }

    pub fn values(&self) -> &[ClearValue] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECRYPTION TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Ephemeral keypair a decryption grant is issued against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantKeypair {
    /// `0x`-hex public key. Shared with the gateway.
    pub public_key: String,
    /// `0x`-hex private key. Never leaves the process.
    pub private_key: String,
}

impl GrantKeypair {
    /// Fresh random keypair. The public key is a tagged digest of the
    /// private key.
    pub fn generate() -> Self {
        let mut private_key = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut private_key);
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"fhes_grant_public_key_v1");
        hasher.update(&private_key);
        let public_key = hasher.finalize();
        Self {
            public_key: format!("0x{}", hex::encode(public_key.as_bytes())),
            private_key: format!("0x{}", hex::encode(private_key)),
        }
    }
}

/// One handle together with the contract it was produced under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleContractPair {
    pub handle: CiphertextHandle,
    pub contract_address: Address,
}

/// Full authorization context for one user decryption call.
#[derive(Clone, Debug)]
pub struct UserDecryptRequest {
    pub pairs: Vec<HandleContractPair>,
    pub keypair: GrantKeypair,
    pub signature: String,
    pub contract_addresses: Vec<Address>,
    pub user_address: Address,
    pub start_timestamp: u64,
    pub duration_days: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPABILITY TRAITS
// ═══════════════════════════════════════════════════════════════════════════════

/// An acquired encryption engine: a factory for chain-bound instances.
#[async_trait]
pub trait FhevmEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Deployment this engine builds instances against for `chain_id`.
    async fn deployment(&self, chain_id: ChainId) -> Result<FhevmDeployment>;

    /// Build a ready-to-use instance.
    async fn create_instance(&self, request: InstanceRequest) -> Result<Arc<dyn FhevmInstance>>;
}

impl std::fmt::Debug for dyn FhevmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhevmEngine")
            .field("kind", &self.kind())
            .finish()
    }
}

/// A live FHE instance bound to one chain and deployment.
#[async_trait]
pub trait FhevmInstance: Send + Sync {
    fn chain_id(&self) -> ChainId;

    fn deployment(&self) -> &FhevmDeployment;

    /// Materials the instance was built with, for cache write-back.
    fn public_materials(&self) -> PublicMaterials;

    /// Encrypt the builder's values into handles plus an input proof.
    async fn encrypt_input(&self, input: &EncryptedInput) -> Result<CiphertextBundle>;

    /// Fresh keypair for a decryption grant.
    fn generate_keypair(&self) -> GrantKeypair;

    /// Typed data the wallet signs to authorize user decryption.
    fn grant_typed_data(
        &self,
        public_key_hex: &str,
        contract_addresses: &[Address],
        start_timestamp: u64,
        duration_days: u64,
    ) -> Value {
        eip712::user_decrypt_typed_data(
            &self.deployment().decryption_domain(),
            public_key_hex,
            contract_addresses,
            start_timestamp,
            duration_days,
        )
    }

    /// Decrypt handles under a signed grant.
    async fn user_decrypt(
        &self,
        request: &UserDecryptRequest,
    ) -> Result<HashMap<CiphertextHandle, ClearValue>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> Address {
        Address::parse("0xaaaabbbbccccddddeeeeffff0000111122223333").unwrap()
    }

    fn user() -> Address {
        Address::parse("0x9999888877776666555544443333222211110000").unwrap()
    }

    #[test]
    fn builder_accumulates_values_in_order() {
        let input = EncryptedInput::new(contract(), user())
            .add_bool(true)
            .add32(42)
            .add64(7)
            .add_address(user());

        assert_eq!(input.values().len(), 4);
        assert_eq!(input.values()[0], ClearValue::Bool(true));
        assert_eq!(input.values()[1], ClearValue::Uint32(42));
        assert_eq!(input.values()[2], ClearValue::Uint64(7));
        assert_eq!(input.values()[3], ClearValue::Address(user()));
        assert!(!input.is_empty());
    }

    #[test]
    fn value_type_tags_follow_the_chain_encoding() {
        assert_eq!(ClearValue::Bool(false).fhe_type(), 0);
        assert_eq!(ClearValue::Uint32(0).fhe_type(), 4);
        assert_eq!(ClearValue::Uint64(0).fhe_type(), 5);
        assert_eq!(ClearValue::Address(user()).fhe_type(), 7);
    }

    #[test]
    fn handle_hex_round_trip() {
        let handle = CiphertextHandle::new([0x5a; 32]);
        let hex = handle.to_hex();
        assert!(hex.starts_with("0x5a5a"));
        assert_eq!(CiphertextHandle::from_hex(&hex).unwrap(), handle);

        assert!(CiphertextHandle::from_hex("0x1234").is_err());
        assert!(CiphertextHandle::from_hex("zz").is_err());
    }

    #[test]
    fn handle_serde_uses_hex_strings() {
        let pair = HandleContractPair {
            handle: CiphertextHandle::new([1; 32]),
            contract_address: contract(),
        };
        let json = serde_json::to_value(&pair).unwrap();
        assert_eq!(
            json["handle"],
            format!("0x{}", "01".repeat(32))
        );
        let back: HandleContractPair = serde_json::from_value(json).unwrap();
        assert_eq!(back, pair);
    }
}
