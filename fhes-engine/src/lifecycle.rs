//! Encryption instance lifecycle.
//!
//! One manager owns the canonical [`EncryptionInstanceState`] for a session.
//! Creation is asynchronous and racy by nature (chain switches, provider
//! swaps, manual refreshes), so every attempt carries a generation counter:
//! only the attempt holding the newest generation may commit its outcome,
//! and superseded attempts finish silently with
//! [`EngineError::CreationAborted`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use fhes_common::provider::{ActiveProviderSource, Eip1193Provider};
use fhes_common::types::ChainId;

use crate::error::{EngineError, Result};
use crate::instance::{EngineKind, FhevmInstance, InstanceRequest};
use crate::materials::MaterialsCache;
use crate::sdk::EngineAcquirer;

// ═══════════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle of the session's encryption instance.
#[derive(Clone)]
pub enum EncryptionInstanceState {
    /// No instance exists and none is being created.
    Idle,
    /// An attempt holding `generation` is underway.
    Creating { generation: u64 },
    /// A live instance serving `chain_id` on `provider`.
    Ready {
        instance: Arc<dyn FhevmInstance>,
        chain_id: ChainId,
        provider: Arc<dyn Eip1193Provider>,
    },
    /// The latest attempt failed and nothing newer has started.
    Failed { cause: String },
}

impl EncryptionInstanceState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn instance(&self) -> Option<&Arc<dyn FhevmInstance>> {
        match self {
            Self::Ready { instance, .. } => Some(instance),
            _ => None,
        }
    }

    pub fn error_cause(&self) -> Option<&str> {
        match self {
            Self::Failed { cause } => Some(cause),
            _ => None,
        }
    }
}

impl std::fmt::Debug for EncryptionInstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Creating { generation } => f
                .debug_struct("Creating")
                .field("generation", generation)
                .finish(),
            Self::Ready { chain_id, .. } => f
                .debug_struct("Ready")
                .field("chain_id", chain_id)
                .finish_non_exhaustive(),
            Self::Failed { cause } => f.debug_struct("Failed").field("cause", cause).finish(),
        }
    }
}

/// Coarse status labels for observers that do not need the full state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceStatus {
    Idle,
    NoProvider,
    Creating,
    Ready,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::NoProvider => "no-provider",
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INSTANCE MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns instance creation, supersession, and the materials cache wiring.
pub struct InstanceManager {
    acquirer: Arc<dyn EngineAcquirer>,
    providers: Arc<dyn ActiveProviderSource>,
    materials: Option<MaterialsCache>,
    state: RwLock<EncryptionInstanceState>,
    generation: AtomicU64,
    status_tx: watch::Sender<InstanceStatus>,
}

impl InstanceManager {
    pub fn new(acquirer: Arc<dyn EngineAcquirer>, providers: Arc<dyn ActiveProviderSource>) -> Self {
        let (status_tx, _) = watch::channel(InstanceStatus::Idle);
        Self {
            acquirer,
            providers,
            materials: None,
            state: RwLock::new(EncryptionInstanceState::Idle),
            generation: AtomicU64::new(0),
            status_tx,
        }
    }

    /// Persist and reuse public materials through `cache`.
    pub fn with_materials_cache(mut self, cache: MaterialsCache) -> Self {
        self.materials = Some(cache);
        self
    }

    /// Snapshot of the current lifecycle state.
    pub async fn state(&self) -> EncryptionInstanceState {
        self.state.read().await.clone()
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status_tx.borrow()
    }

    /// Observe status transitions without polling.
    pub fn watch_status(&self) -> watch::Receiver<InstanceStatus> {
        self.status_tx.subscribe()
    }

    /// The live instance, if the state is `Ready`.
    pub async fn instance(&self) -> Option<Arc<dyn FhevmInstance>> {
        match &*self.state.read().await {
            EncryptionInstanceState::Ready { instance, .. } => Some(Arc::clone(instance)),
            _ => None,
        }
    }

    /// Drop any instance and cancel whatever is in flight.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        *state = EncryptionInstanceState::Idle;
        drop(state);
        self.set_status(InstanceStatus::Idle);
        tracing::debug!("instance manager cleared");
    }

    /// Ensure a live instance for `chain_id` on the active provider.
    ///
    /// A matching ready instance is returned as-is. Otherwise a new creation
    /// attempt starts and anything in flight becomes stale. The returned
    /// state is whatever this attempt committed; superseded attempts return
    /// [`EngineError::CreationAborted`] instead.
    pub async fn ensure_instance(&self, chain_id: ChainId) -> Result<EncryptionInstanceState> {
        let provider = match self.providers.active_provider() {
            Some(provider) => provider,
            None => {
                let mut state = self.state.write().await;
                self.generation.fetch_add(1, Ordering::SeqCst);
                *state = EncryptionInstanceState::Idle;
                drop(state);
                self.set_status(InstanceStatus::NoProvider);
                tracing::debug!("no active provider, nothing to build against");
                return Ok(EncryptionInstanceState::Idle);
            }
        };

        {
            let state = self.state.read().await;
            if let EncryptionInstanceState::Ready {
                chain_id: ready_chain,
                provider: ready_provider,
                ..
            } = &*state
            {
                if *ready_chain == chain_id && Arc::ptr_eq(ready_provider, &provider) {
                    return Ok(state.clone());
                }
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state.write().await;
            *state = EncryptionInstanceState::Creating { generation };
        }
        self.set_status(InstanceStatus::Creating);
        tracing::debug!(chain = %chain_id, generation, "creating encryption instance");

        match self.create_attempt(generation, chain_id).await {
            Ok(instance) => {
                let ready = EncryptionInstanceState::Ready {
                    instance,
                    chain_id,
                    provider: Arc::clone(&provider),
                };
                if self.commit(generation, &provider, ready.clone()).await {
                    self.set_status(InstanceStatus::Ready);
                    tracing::info!(chain = %chain_id, "encryption instance ready");
                    Ok(ready)
                } else {
                    Err(EngineError::CreationAborted)
                }
            }
            Err(EngineError::CreationAborted) => Err(EngineError::CreationAborted),
            Err(e) => {
                let failed = EncryptionInstanceState::Failed {
                    cause: e.to_string(),
                };
                if self.commit(generation, &provider, failed).await {
                    self.set_status(InstanceStatus::Error);
                    tracing::warn!(chain = %chain_id, "instance creation failed: {e}");
                    Err(e)
                } else {
                    Err(EngineError::CreationAborted)
                }
            }
        }
    }

    // === Private helpers ===

    /// Acquire the engine, thread cached materials through, and build.
    /// Checks for supersession between every suspension point.
    async fn create_attempt(
        &self,
        generation: u64,
        chain_id: ChainId,
    ) -> Result<Arc<dyn FhevmInstance>> {
        let engine = self.acquirer.acquire(chain_id).await?;
        self.abort_if_stale(generation)?;

        // Cached materials only help the remote path; the mock synthesizes
        // its own.
        let seeded_materials = match (&self.materials, engine.kind()) {
            (Some(cache), EngineKind::Relayer) => {
                let deployment = engine.deployment(chain_id).await?;
                self.abort_if_stale(generation)?;
                cache.load(&deployment.acl_address).await
            }
            _ => None,
        };
        self.abort_if_stale(generation)?;

        let instance = engine
            .create_instance(InstanceRequest {
                chain_id,
                seeded_materials,
            })
            .await?;
        self.abort_if_stale(generation)?;

        if let (Some(cache), EngineKind::Relayer) = (&self.materials, engine.kind()) {
            cache
                .save(&instance.deployment().acl_address, &instance.public_materials())
                .await;
        }
        Ok(instance)
    }

    /// Install `new_state` only if this attempt still holds the newest
    /// generation and `provider` is still the one the session reports as
    /// active. The checks run under the state write lock so a stale attempt
    /// can never clobber a newer commit.
    async fn commit(
        &self,
        generation: u64,
        provider: &Arc<dyn Eip1193Provider>,
        new_state: EncryptionInstanceState,
    ) -> bool {
        let mut state = self.state.write().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "discarding superseded instance outcome");
            return false;
        }
        let still_active = self
            .providers
            .active_provider()
            .is_some_and(|active| Arc::ptr_eq(&active, provider));
        if !still_active {
            tracing::debug!(generation, "discarding outcome for an inactive provider");
            return false;
        }
        *state = new_state;
        true
    }

    fn abort_if_stale(&self, generation: u64) -> Result<()> {
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "instance creation superseded");
            return Err(EngineError::CreationAborted);
        }
        Ok(())
    }

    fn set_status(&self, status: InstanceStatus) {
        self.status_tx.send_replace(status);
    }
}
