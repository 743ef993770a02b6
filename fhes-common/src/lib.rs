//! Shared foundation for the fhes session toolkit.
//!
//! This crate carries what both halves of the toolkit need: chain-level
//! types ([`Address`], [`ChainId`]), the wallet provider capability trait
//! ([`Eip1193Provider`]) with its discovery descriptor and event stream, and
//! the persisted key-value store ([`SessionStore`]) that wallet sessions,
//! public materials, and decryption grants are cached through.

pub mod provider;
pub mod storage;
pub mod types;

pub use provider::{
    ActiveProviderSource, Eip1193Provider, EventHub, ProviderDescriptor, ProviderEvent,
    ProviderSubscription, RpcError, SubscriptionId, WalletSigner,
};
pub use storage::{FileStore, MemoryStore, SessionStore, StorageError};
pub use types::{Address, ChainId, ParseError};

/// Current unix time in seconds.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time went backwards")
        .as_secs()
}
