//! Engine acquisition behind one gate.
//!
//! The strategy is a pure function of chain id: chains listed in
//! [`EngineConfig::mock_chains`] get an in-process mock engine (one per
//! chain, reused), everything else shares the remote relayer engine. The
//! remote SDK is fetched at most once per process; concurrent acquisitions
//! share the in-flight load and the outcome sticks for the process lifetime
//! either way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OnceCell, RwLock};

use fhes_common::types::ChainId;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::instance::FhevmEngine;
use crate::mock::MockEngine;
use crate::relayer::{self, ArtifactFetcher, HttpArtifactFetcher, RelayerEngine};

/// Which engine family serves a chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SdkStrategy {
    Mock { rpc_url: String },
    Remote,
}

/// Strategy for `chain_id` under `config`. Pure; no IO.
pub fn select_strategy(config: &EngineConfig, chain_id: ChainId) -> SdkStrategy {
    match config.mock_rpc_url(chain_id) {
        Some(rpc_url) => SdkStrategy::Mock {
            rpc_url: rpc_url.to_string(),
        },
        None => SdkStrategy::Remote,
    }
}

/// Hands out engines for chains.
#[async_trait]
pub trait EngineAcquirer: Send + Sync {
    async fn acquire(&self, chain_id: ChainId) -> Result<Arc<dyn FhevmEngine>>;
}

/// Production acquirer: one mock engine per dev chain, one shared remote
/// engine for everything else.
pub struct SdkAcquirer {
    config: EngineConfig,
    fetcher: Arc<dyn ArtifactFetcher>,
    mock_engines: RwLock<HashMap<u64, Arc<MockEngine>>>,
    remote: OnceCell<std::result::Result<Arc<RelayerEngine>, String>>,
}

impl SdkAcquirer {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        Self::with_fetcher(config, Arc::new(HttpArtifactFetcher::new(timeout)))
    }

    /// Acquirer with a custom artifact fetcher.
    pub fn with_fetcher(config: EngineConfig, fetcher: Arc<dyn ArtifactFetcher>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            fetcher,
            mock_engines: RwLock::new(HashMap::new()),
            remote: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // === Private helpers ===

    async fn mock_engine(&self, chain_id: ChainId, rpc_url: &str) -> Arc<MockEngine> {
        if let Some(engine) = self.mock_engines.read().await.get(&chain_id.as_u64()) {
            return Arc::clone(engine);
        }
        let mut engines = self.mock_engines.write().await;
        let engine = engines.entry(chain_id.as_u64()).or_insert_with(|| {
            tracing::debug!(chain = %chain_id, "building mock engine");
            Arc::new(MockEngine::new(
                chain_id,
                rpc_url,
                Duration::from_secs(self.config.http_timeout_secs),
            ))
        });
        Arc::clone(engine)
    }

    /// The process-wide remote engine. The first caller performs the load,
    /// concurrent callers wait on it, and the outcome is permanent.
    async fn remote_engine(&self) -> Result<Arc<RelayerEngine>> {
        let sdk_url = self.config.sdk_url.clone();
        let relayer_url = self.config.relayer_url.clone();
        let timeout = Duration::from_secs(self.config.http_timeout_secs);
        let fetcher = Arc::clone(&self.fetcher);

        let outcome = self
            .remote
            .get_or_init(|| async move {
                let load = async {
                    let sdk = relayer::load_relayer_sdk(fetcher.as_ref(), &sdk_url).await?;
                    RelayerEngine::new(sdk, relayer_url, timeout)
                };
                match load.await {
                    Ok(engine) => Ok(Arc::new(engine)),
                    Err(e) => {
                        let cause = match e {
                            EngineError::SdkLoadFailed(cause) => cause,
                            other => other.to_string(),
                        };
                        tracing::error!("relayer SDK load failed permanently: {cause}");
                        Err(cause)
                    }
                }
            })
            .await;

        match outcome {
            Ok(engine) => Ok(Arc::clone(engine)),
            Err(cause) => Err(EngineError::SdkLoadFailed(cause.clone())),
        }
    }
}

#[async_trait]
impl EngineAcquirer for SdkAcquirer {
    async fn acquire(&self, chain_id: ChainId) -> Result<Arc<dyn FhevmEngine>> {
        match select_strategy(&self.config, chain_id) {
            SdkStrategy::Mock { rpc_url } => {
                let engine: Arc<dyn FhevmEngine> = self.mock_engine(chain_id, &rpc_url).await;
                Ok(engine)
            }
            SdkStrategy::Remote => {
                let engine: Arc<dyn FhevmEngine> = self.remote_engine().await?;
                Ok(engine)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::EngineKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        /// `None` simulates an unreachable CDN.
        artifact: Option<Vec<u8>>,
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        fn valid() -> Self {
            Self {
                artifact: Some(b"initSDK createInstance SepoliaConfig".to_vec()),
                calls: AtomicUsize::new(0),
            }
        }

        fn unreachable() -> Self {
            Self {
                artifact: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ArtifactFetcher for CountingFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.artifact {
                Some(bytes) => Ok(bytes.clone()),
                None => Err(EngineError::Http("cdn unreachable".to_string())),
            }
        }
    }

    #[test]
    fn strategy_is_a_pure_function_of_chain_id() {
        let config = EngineConfig::default();
        assert_eq!(
            select_strategy(&config, ChainId(31337)),
            SdkStrategy::Mock {
                rpc_url: "http://localhost:8545".to_string()
            }
        );
        assert_eq!(select_strategy(&config, ChainId(11155111)), SdkStrategy::Remote);
        assert_eq!(select_strategy(&config, ChainId(1)), SdkStrategy::Remote);
    }

    #[tokio::test]
    async fn mock_engines_are_reused_per_chain() {
        let config = EngineConfig::default().with_mock_chain(1234, "http://localhost:9999");
        let acquirer =
            SdkAcquirer::with_fetcher(config, Arc::new(CountingFetcher::valid())).unwrap();

        let a = acquirer.acquire(ChainId(31337)).await.unwrap();
        let b = acquirer.acquire(ChainId(31337)).await.unwrap();
        let c = acquirer.acquire(ChainId(1234)).await.unwrap();

        assert_eq!(a.kind(), EngineKind::Mock);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn remote_sdk_is_fetched_once_across_concurrent_acquisitions() {
        let fetcher = Arc::new(CountingFetcher::valid());
        let acquirer = Arc::new(
            SdkAcquirer::with_fetcher(EngineConfig::default(), fetcher.clone()).unwrap(),
        );

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let acquirer = Arc::clone(&acquirer);
                tokio::spawn(async move { acquirer.acquire(ChainId(11155111)).await })
            })
            .collect();
        for outcome in futures::future::join_all(tasks).await {
            outcome.unwrap().unwrap();
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // A later acquisition for a different remote chain reuses the load.
        acquirer.acquire(ChainId(1)).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_remote_load_is_sticky() {
        let fetcher = Arc::new(CountingFetcher::unreachable());
        let acquirer =
            SdkAcquirer::with_fetcher(EngineConfig::default(), fetcher.clone()).unwrap();

        let first = acquirer.acquire(ChainId(11155111)).await.unwrap_err();
        assert!(matches!(first, EngineError::SdkLoadFailed(_)));

        let second = acquirer.acquire(ChainId(11155111)).await.unwrap_err();
        assert!(matches!(second, EngineError::SdkLoadFailed(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mock_chains_never_touch_the_fetcher() {
        let fetcher = Arc::new(CountingFetcher::unreachable());
        let acquirer =
            SdkAcquirer::with_fetcher(EngineConfig::default(), fetcher.clone()).unwrap();

        acquirer.acquire(ChainId(31337)).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = EngineConfig::default().with_sdk_url("not a url");
        assert!(matches!(
            SdkAcquirer::new(config),
            Err(EngineError::Config(_))
        ));
    }
}
