//! Error types for FHE engine acquisition and instance handling.

use thiserror::Error;

use fhes_common::provider::RpcError;
use fhes_common::storage::StorageError;
use fhes_common::types::ParseError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the FHE engine layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The remote encryption SDK could not be fetched or failed validation.
    /// Sticky for the life of the process; every later remote acquisition
    /// reports the same cause.
    #[error("relayer SDK load failed: {0}")]
    SdkLoadFailed(String),

    /// An instance creation attempt was superseded by a newer request or a
    /// cleared manager. Callers treat this as silence, not failure.
    #[error("instance creation aborted: superseded by a newer request")]
    CreationAborted,

    /// The chain's deployment metadata query failed and no fallback applied.
    #[error("deployment metadata query failed: {0}")]
    MetadataQueryFailed(String),

    /// An FHE instance operation failed (encryption, decryption, key export).
    #[error("instance operation failed: {0}")]
    Instance(String),

    /// The wallet declined or failed to produce the grant signature. The
    /// grant cache is left untouched when this is raised.
    #[error("grant signing failed: {0}")]
    GrantSigningFailed(String),

    /// Engine configuration rejected up front.
    #[error("invalid engine configuration: {0}")]
    Config(String),

    /// HTTP transport failure talking to the relayer or an artifact host.
    #[error("http error: {0}")]
    Http(String),

    /// Provider RPC failure.
    #[error("provider error: {0}")]
    Rpc(#[from] RpcError),

    /// Persisted store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Malformed chain data from an RPC response or the store.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}
