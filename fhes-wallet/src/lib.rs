//! # Wallet discovery and connection for the fhes session toolkit
//!
//! This crate owns the user-facing half of an encrypted session: discovering
//! injected wallet providers and running the single process-wide connection
//! state machine over them.
//!
//! ## State machine
//!
//! ```text
//! Disconnected --record found & connector discovered--> Connecting (silent)
//! Connecting   --no accounts / request fails----------> Disconnected
//! Connecting   --accounts non-empty-------------------> Connected
//! Connected    --accountsChanged []-------------------> Disconnected (record cleared)
//! Connected    --chainChanged-------------------------> Connected (chain updated in place)
//! Connected    --disconnect()-------------------------> Disconnected (record cleared)
//! Disconnected --connect()----------------------------> Connecting (interactive)
//! ```
//!
//! Silent reconnect uses a non-interactive account query and runs at most
//! once per process. Interactive connect may prompt the user and persists
//! the session (connector id, accounts, chain id) on success, so the next
//! launch can restore it silently.

pub mod coordinator;
pub mod error;
pub mod registry;
pub mod session;

pub use coordinator::{ConnectionState, WalletCoordinator};
pub use error::{Result, WalletError};
pub use registry::{DiscoveredProvider, ProviderRegistry};
pub use session::{
    PersistedSessionRecord, KEY_CONNECTED, KEY_LAST_ACCOUNTS, KEY_LAST_CHAIN_ID,
    KEY_LAST_CONNECTOR_ID,
};
