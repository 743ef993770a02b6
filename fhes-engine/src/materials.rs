//! Cached public cryptographic materials.
//!
//! Instance creation needs the deployment's FHE public key and public
//! parameters, which are large and slow to fetch. They are cached in the
//! session store keyed by ACL contract address. The cache is a latency
//! optimization only: a miss falls back to fetching, and engines validate
//! whatever they are handed instead of trusting it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fhes_common::storage::SessionStore;
use fhes_common::types::Address;

const KEY_PREFIX: &str = "fhevm.publicMaterials.";

/// Serializes binary blobs as `0x`-hex strings.
pub(crate) mod hex_blob {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let body = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(body).map_err(serde::de::Error::custom)
    }
}

/// A deployment's FHE public key and public parameters, with provenance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicMaterials {
    #[serde(with = "hex_blob")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex_blob")]
    pub public_params: Vec<u8>,
    /// When these materials were fetched from their source.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub cached_at: DateTime<Utc>,
}

impl PublicMaterials {
    pub fn new(public_key: Vec<u8>, public_params: Vec<u8>) -> Self {
        Self {
            public_key,
            public_params,
            cached_at: Utc::now(),
        }
    }
}

/// ACL-keyed cache of [`PublicMaterials`] over the session store.
///
/// Reads and writes degrade to cache misses on failure; the store must never
/// be able to break instance creation.
#[derive(Clone)]
pub struct MaterialsCache {
    store: Arc<dyn SessionStore>,
}

impl MaterialsCache {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    fn key(acl_address: &Address) -> String {
        format!("{KEY_PREFIX}{}", acl_address.as_str())
    }

    /// Cached materials for `acl_address`, or `None` on miss or any failure.
    pub async fn load(&self, acl_address: &Address) -> Option<PublicMaterials> {
        let key = Self::key(acl_address);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!("materials cache read failed for {acl_address}: {e}");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(materials) => Some(materials),
            Err(e) => {
                tracing::warn!("discarding malformed cached materials for {acl_address}: {e}");
                let _ = self.store.delete(&key).await;
                None
            }
        }
    }

    /// Replace the cached materials for `acl_address`. Best effort.
    pub async fn save(&self, acl_address: &Address, materials: &PublicMaterials) {
        let key = Self::key(acl_address);
        let json = match serde_json::to_string(materials) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("materials for {acl_address} did not serialize: {e}");
                return;
            }
        };
        if let Err(e) = self.store.put(&key, &json).await {
            tracing::warn!("materials cache write failed for {acl_address}: {e}");
        }
    }
}
