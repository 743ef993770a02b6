//! Persisted wallet session records.
//!
//! A record is written on every successful explicit connect and on every
//! account/chain-change event, read once at startup for silent reconnect,
//! and deleted on disconnect or genuine revocation. The four keys mirror
//! what a browser session layer would keep in local storage.

use fhes_common::storage::{SessionStore, StorageError};
use fhes_common::types::{Address, ChainId};

pub const KEY_CONNECTED: &str = "wallet.connected";
pub const KEY_LAST_CONNECTOR_ID: &str = "wallet.lastConnectorId";
pub const KEY_LAST_ACCOUNTS: &str = "wallet.lastAccounts";
pub const KEY_LAST_CHAIN_ID: &str = "wallet.lastChainId";

/// The restorable part of a wallet session.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistedSessionRecord {
    /// Reverse-domain id of the connector that produced the session.
    pub connector_id: String,
    /// Authorized accounts, in provider order. Never empty once persisted.
    pub accounts: Vec<Address>,
    /// Chain id as the hex quantity the provider reported.
    pub chain_id_hex: String,
}

impl PersistedSessionRecord {
    pub fn chain_id(&self) -> Option<ChainId> {
        ChainId::from_hex(&self.chain_id_hex).ok()
    }
}

/// Load the persisted record, if a complete and well-formed one exists.
///
/// A malformed or partial record is deleted (best effort) and reads as
/// absent; store read errors also read as absent so startup never fails on
/// cache trouble.
pub async fn load_record(store: &dyn SessionStore) -> Option<PersistedSessionRecord> {
    match try_load(store).await {
        Ok(record) => record,
        Err(LoadFailure::Storage(e)) => {
            tracing::debug!("session record unreadable, treating as absent: {e}");
            None
        }
        Err(LoadFailure::Malformed(reason)) => {
            tracing::warn!("discarding malformed session record: {reason}");
            if let Err(e) = clear_record(store).await {
                tracing::warn!("failed to clear malformed session record: {e}");
            }
            None
        }
    }
}

/// Persist the record under the four wallet keys.
pub async fn save_record(
    store: &dyn SessionStore,
    record: &PersistedSessionRecord,
) -> Result<(), StorageError> {
    let accounts_json = serde_json::to_string(&record.accounts)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    store.put(KEY_CONNECTED, "true").await?;
    store.put(KEY_LAST_CONNECTOR_ID, &record.connector_id).await?;
    store.put(KEY_LAST_ACCOUNTS, &accounts_json).await?;
    store.put(KEY_LAST_CHAIN_ID, &record.chain_id_hex).await?;
    Ok(())
}

/// Delete all four wallet keys.
pub async fn clear_record(store: &dyn SessionStore) -> Result<(), StorageError> {
    store.delete(KEY_CONNECTED).await?;
    store.delete(KEY_LAST_CONNECTOR_ID).await?;
    store.delete(KEY_LAST_ACCOUNTS).await?;
    store.delete(KEY_LAST_CHAIN_ID).await?;
    Ok(())
}

enum LoadFailure {
    Storage(StorageError),
    Malformed(String),
}

impl From<StorageError> for LoadFailure {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

async fn try_load(
    store: &dyn SessionStore,
) -> Result<Option<PersistedSessionRecord>, LoadFailure> {
    match store.get(KEY_CONNECTED).await?.as_deref() {
        Some("true") => {}
        Some(other) => {
            return Err(LoadFailure::Malformed(format!(
                "unexpected connected flag {other:?}"
            )))
        }
        None => return Ok(None),
    }

    let connector_id = store
        .get(KEY_LAST_CONNECTOR_ID)
        .await?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LoadFailure::Malformed("missing connector id".to_string()))?;

    let accounts_json = store
        .get(KEY_LAST_ACCOUNTS)
        .await?
        .ok_or_else(|| LoadFailure::Malformed("missing account list".to_string()))?;
    let accounts: Vec<Address> = serde_json::from_str(&accounts_json)
        .map_err(|e| LoadFailure::Malformed(format!("bad account list: {e}")))?;
    if accounts.is_empty() {
        return Err(LoadFailure::Malformed("empty account list".to_string()));
    }

    let chain_id_hex = store
        .get(KEY_LAST_CHAIN_ID)
        .await?
        .ok_or_else(|| LoadFailure::Malformed("missing chain id".to_string()))?;

    Ok(Some(PersistedSessionRecord {
        connector_id,
        accounts,
        chain_id_hex,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhes_common::storage::MemoryStore;

    fn test_record() -> PersistedSessionRecord {
        PersistedSessionRecord {
            connector_id: "io.metamask".to_string(),
            accounts: vec![
                Address::parse("0xaaaabbbbccccddddeeeeffff0000111122223333").unwrap(),
            ],
            chain_id_hex: "0x7a69".to_string(),
        }
    }

    #[tokio::test]
    async fn record_round_trips() {
        let store = MemoryStore::new();
        save_record(&store, &test_record()).await.unwrap();

        let loaded = load_record(&store).await.unwrap();
        assert_eq!(loaded, test_record());
        assert_eq!(loaded.chain_id(), Some(ChainId(31337)));
    }

    #[tokio::test]
    async fn absent_record_reads_as_none() {
        let store = MemoryStore::new();
        assert!(load_record(&store).await.is_none());
    }

    #[tokio::test]
    async fn clear_removes_every_key() {
        let store = MemoryStore::new();
        save_record(&store, &test_record()).await.unwrap();
        clear_record(&store).await.unwrap();

        assert!(load_record(&store).await.is_none());
        assert_eq!(store.get(KEY_CONNECTED).await.unwrap(), None);
        assert_eq!(store.get(KEY_LAST_CONNECTOR_ID).await.unwrap(), None);
        assert_eq!(store.get(KEY_LAST_ACCOUNTS).await.unwrap(), None);
        assert_eq!(store.get(KEY_LAST_CHAIN_ID).await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_record_is_discarded_and_deleted() {
        let store = MemoryStore::new();
        store.put(KEY_CONNECTED, "true").await.unwrap();
        store.put(KEY_LAST_CONNECTOR_ID, "io.metamask").await.unwrap();
        store.put(KEY_LAST_ACCOUNTS, "not json").await.unwrap();
        store.put(KEY_LAST_CHAIN_ID, "0x1").await.unwrap();

        assert!(load_record(&store).await.is_none());
        // The broken record was cleaned up.
        assert_eq!(store.get(KEY_CONNECTED).await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_account_list_is_malformed() {
        let store = MemoryStore::new();
        store.put(KEY_CONNECTED, "true").await.unwrap();
        store.put(KEY_LAST_CONNECTOR_ID, "io.metamask").await.unwrap();
        store.put(KEY_LAST_ACCOUNTS, "[]").await.unwrap();
        store.put(KEY_LAST_CHAIN_ID, "0x1").await.unwrap();

        assert!(load_record(&store).await.is_none());
    }
}
