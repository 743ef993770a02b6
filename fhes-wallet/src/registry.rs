//! Passive wallet provider discovery.
//!
//! The registry broadcasts one "request providers" signal at startup and
//! accumulates announcements from environment adapters. Discovery is
//! append-only for the life of the process: a provider seen once stays
//! listed, and duplicate announcements for the same id are ignored. An
//! empty registry is a reportable state, not an error.

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use fhes_common::provider::{Eip1193Provider, ProviderDescriptor};

/// A provider the environment has announced: its identity plus the live
/// capability handle.
#[derive(Clone)]
pub struct DiscoveredProvider {
    pub descriptor: ProviderDescriptor,
    pub provider: Arc<dyn Eip1193Provider>,
}

/// Accumulates provider announcements, keyed by reverse-domain id.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<DiscoveredProvider>>>,
    request_tx: broadcast::Sender<()>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let (request_tx, _) = broadcast::channel(8);
        Self {
            providers: Arc::new(RwLock::new(Vec::new())),
            request_tx,
        }
    }

    /// Broadcast the discovery signal. Environment adapters listening via
    /// [`ProviderRegistry::on_request`] respond by calling `announce`.
    pub fn request_providers(&self) {
        tracing::debug!("requesting provider announcements");
        let _ = self.request_tx.send(());
    }

    /// Subscribe to discovery signals. For environment adapters.
    pub fn on_request(&self) -> broadcast::Receiver<()> {
        self.request_tx.subscribe()
    }

    /// Record an announced provider. Duplicate ids are ignored.
    pub async fn announce(
        &self,
        descriptor: ProviderDescriptor,
        provider: Arc<dyn Eip1193Provider>,
    ) {
        let mut providers = self.providers.write().await;
        if providers.iter().any(|p| p.descriptor.id == descriptor.id) {
            tracing::debug!("provider {} already announced, ignoring", descriptor.id);
            return;
        }
        tracing::info!(
            "wallet provider announced: {} ({})",
            descriptor.id,
            descriptor.display_name
        );
        providers.push(DiscoveredProvider {
            descriptor,
            provider,
        });
    }

    /// Snapshot of all announced descriptors, in announcement order.
    pub async fn list(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.descriptor.clone())
            .collect()
    }

    /// Look a provider up by its reverse-domain id.
    pub async fn get(&self, id: &str) -> Option<DiscoveredProvider> {
        self.providers
            .read()
            .await
            .iter()
            .find(|p| p.descriptor.id == id)
            .cloned()
    }

    /// The first announced provider, if any.
    pub async fn first(&self) -> Option<DiscoveredProvider> {
        self.providers.read().await.first().cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.read().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
