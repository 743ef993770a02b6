//! # FHE engine acquisition and instance lifecycle
//!
//! This crate owns the encryption half of an encrypted session: deciding
//! which engine serves a chain (in-process mock for development chains, the
//! published relayer SDK for everything else), creating instances against
//! the active wallet provider under supersession-safe cancellation, caching
//! public materials across launches, and issuing the signed decryption
//! grants user decryption is authorized by.
//!
//! The usual wiring, top down:
//!
//! ```text
//! SdkAcquirer (engine per chain, remote SDK fetched once)
//!     └─ InstanceManager (generation-guarded creation, status watch)
//!          ├─ MaterialsCache (public key/params per ACL address)
//!          └─ FhevmInstance (encrypt_input / user_decrypt)
//!               └─ GrantCache (signed, time-bounded decryption grants)
//! ```
//!
//! Only the newest `ensure_instance` attempt may ever commit a `Ready` or
//! `Failed` state; superseded attempts finish silently with
//! [`EngineError::CreationAborted`].

pub mod config;
pub mod eip712;
pub mod error;
pub mod grant;
pub mod instance;
pub mod lifecycle;
pub mod materials;
pub mod metadata;
pub mod mock;
pub mod relayer;
pub mod sdk;

pub use config::{EngineConfig, DEFAULT_RELAYER_URL, RELAYER_SDK_URL};
pub use error::{EngineError, Result};
pub use grant::{decrypt_with_grant, DecryptionGrant, GrantCache};
pub use instance::{
    CiphertextBundle, CiphertextHandle, ClearValue, EncryptedInput, EngineKind, FhevmDeployment,
    FhevmEngine, FhevmInstance, GrantKeypair, HandleContractPair, InstanceRequest,
    UserDecryptRequest,
};
pub use lifecycle::{EncryptionInstanceState, InstanceManager, InstanceStatus};
pub use materials::{MaterialsCache, PublicMaterials};
pub use sdk::{select_strategy, EngineAcquirer, SdkAcquirer, SdkStrategy};
