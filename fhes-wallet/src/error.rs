//! Error types for wallet connection handling.

use thiserror::Error;

use fhes_common::provider::RpcError;
use fhes_common::storage::StorageError;
use fhes_common::types::ParseError;

/// Result type alias for wallet operations.
pub type Result<T> = std::result::Result<T, WalletError>;

/// Errors surfaced by the wallet connection state machine.
#[derive(Debug, Error)]
pub enum WalletError {
    /// No provider has been discovered. User-recoverable; the caller can
    /// retry after one announces itself.
    #[error("no wallet provider available")]
    NoProviderAvailable,

    /// The non-interactive reconnect attempt did not restore the session.
    /// Never propagated to callers; `revoked` decides whether the persisted
    /// record is cleared (genuine revocation) or kept (transient failure).
    #[error("silent reconnect failed: {cause}")]
    SilentReconnectFailed { cause: String, revoked: bool },

    /// The interactive connect request was rejected or errored.
    #[error("connect failed: {cause}")]
    ExplicitConnectFailed { cause: String },

    /// Provider RPC failure outside the connect flows.
    #[error("provider error: {0}")]
    Rpc(#[from] RpcError),

    /// Persisted store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Malformed chain data from a provider or the store.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}
