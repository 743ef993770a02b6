//! Decryption grants.
//!
//! User decryption is authorized by a wallet signature over a typed-data
//! document binding an ephemeral keypair, a contract scope, and a validity
//! window. Every signature prompts the user, so grants are cached per user
//! and deployment and reused while they still cover what is being asked.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fhes_common::current_timestamp;
use fhes_common::provider::WalletSigner;
use fhes_common::storage::SessionStore;
use fhes_common::types::Address;

use crate::error::{EngineError, Result};
use crate::instance::{
    CiphertextHandle, ClearValue, FhevmInstance, GrantKeypair, HandleContractPair,
    UserDecryptRequest,
};

const KEY_PREFIX: &str = "fhevm.decryptionGrant.";
const SECONDS_PER_DAY: u64 = 86_400;

// ═══════════════════════════════════════════════════════════════════════════════
// GRANT
// ═══════════════════════════════════════════════════════════════════════════════

/// A signed authorization to decrypt under one keypair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionGrant {
    pub keypair: GrantKeypair,
    pub signature: String,
    pub user_address: Address,
    /// Contracts the grant covers, sorted for stable comparison.
    pub contract_addresses: Vec<Address>,
    pub start_timestamp: u64,
    pub duration_days: u64,
}

impl DecryptionGrant {
    /// Whether the grant is inside its validity window at `now`.
    pub fn is_valid_at(&self, now: u64) -> bool {
        now < self
            .start_timestamp
            .saturating_add(self.duration_days.saturating_mul(SECONDS_PER_DAY))
    }

    /// Whether every requested contract is inside the granted scope.
    pub fn covers(&self, contracts: &[Address]) -> bool {
        contracts.iter().all(|c| self.contract_addresses.contains(c))
    }

    pub fn matches_user(&self, user: &Address) -> bool {
        self.user_address == *user
    }

    /// Assemble the engine-level decryption request for `pairs`.
    pub fn decrypt_request(&self, pairs: Vec<HandleContractPair>) -> UserDecryptRequest {
        UserDecryptRequest {
            pairs,
            keypair: self.keypair.clone(),
            signature: self.signature.clone(),
            contract_addresses: self.contract_addresses.clone(),
            user_address: self.user_address.clone(),
            start_timestamp: self.start_timestamp,
            duration_days: self.duration_days,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GRANT CACHE
// ═══════════════════════════════════════════════════════════════════════════════

/// Persisted cache of decryption grants, one slot per user and deployment.
pub struct GrantCache {
    store: Arc<dyn SessionStore>,
    validity_days: u64,
}

impl GrantCache {
    pub fn new(store: Arc<dyn SessionStore>, validity_days: u64) -> Self {
        Self {
            store,
            validity_days,
        }
    }

    /// Return a cached grant covering `contract_addresses`, or create, sign,
    /// and cache a fresh one.
    ///
    /// A cached grant is reused verbatim only when it belongs to the
    /// signer's account, is unexpired, and its scope is a superset of the
    /// request. A signing failure propagates and leaves the cache untouched.
    pub async fn get_or_create(
        &self,
        instance: &dyn FhevmInstance,
        signer: &WalletSigner,
        contract_addresses: &[Address],
    ) -> Result<DecryptionGrant> {
        let user = signer.account();
        let mut requested: Vec<Address> = contract_addresses.to_vec();
        requested.sort();
        requested.dedup();

        let key = self.cache_key(&instance.deployment().acl_address, user);
        if let Some(grant) = self.load(&key).await {
            if grant.matches_user(user)
                && grant.is_valid_at(current_timestamp())
                && grant.covers(&requested)
            {
                tracing::debug!(user = %user, "reusing cached decryption grant");
                return Ok(grant);
            }
            tracing::debug!(user = %user, "cached decryption grant is unusable, regenerating");
        }

        let keypair = instance.generate_keypair();
        let start_timestamp = current_timestamp();
        let typed_data = instance.grant_typed_data(
            &keypair.public_key,
            &requested,
            start_timestamp,
            self.validity_days,
        );
        let signature = signer
            .sign_typed_data(&typed_data)
            .await
            .map_err(|e| EngineError::GrantSigningFailed(e.to_string()))?;

        let grant = DecryptionGrant {
            keypair,
            signature,
            user_address: user.clone(),
            contract_addresses: requested,
            start_timestamp,
            duration_days: self.validity_days,
        };
        self.save(&key, &grant).await;
        tracing::info!(
            user = %user,
            contracts = grant.contract_addresses.len(),
            "issued new decryption grant"
        );
        Ok(grant)
    }

    // === Private helpers ===

    /// One slot per (deployment, user). Contract scope is checked on the
    /// stored grant, not in the key, so a wider grant serves narrower
    /// requests.
    fn cache_key(&self, acl_address: &Address, user: &Address) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"fhes_grant_cache_v1");
        hasher.update(&acl_address.to_bytes());
        hasher.update(&user.to_bytes());
        format!("{KEY_PREFIX}{}", hasher.finalize().to_hex())
    }

    async fn load(&self, key: &str) -> Option<DecryptionGrant> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!("grant cache read failed: {e}");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(grant) => Some(grant),
            Err(e) => {
                tracing::warn!("discarding malformed cached grant: {e}");
                let _ = self.store.delete(key).await;
                None
            }
        }
    }

    /// Replace the cached grant. Best effort: the freshly signed grant is
    /// usable whether or not the write lands.
    async fn save(&self, key: &str, grant: &DecryptionGrant) {
        let json = match serde_json::to_string(grant) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("decryption grant did not serialize: {e}");
                return;
            }
        };
        if let Err(e) = self.store.put(key, &json).await {
            tracing::warn!("grant cache write failed: {e}");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Decrypt `pairs` under `grant`, checking scope and expiry up front.
pub async fn decrypt_with_grant(
    instance: &dyn FhevmInstance,
    grant: &DecryptionGrant,
    pairs: &[HandleContractPair],
) -> Result<HashMap<CiphertextHandle, ClearValue>> {
    if pairs.is_empty() {
        return Ok(HashMap::new());
    }
    if !grant.is_valid_at(current_timestamp()) {
        return Err(EngineError::Instance(
            "decryption grant expired".to_string(),
        ));
    }
    let scope: Vec<Address> = pairs.iter().map(|p| p.contract_address.clone()).collect();
    if !grant.covers(&scope) {
        return Err(EngineError::Instance(
            "handle outside the granted contract scope".to_string(),
        ));
    }
    instance
        .user_decrypt(&grant.decrypt_request(pairs.to_vec()))
        .await
}
