//! Wallet connection state machine.
//!
//! Owns the single process-wide connection state: silent reconnect at
//! startup, interactive connect, disconnect, and event-driven sync with the
//! active provider's account and chain notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use fhes_common::provider::{
    methods, ActiveProviderSource, Eip1193Provider, ProviderDescriptor, ProviderEvent, RpcError,
    SubscriptionId, WalletSigner,
};
use fhes_common::storage::SessionStore;
use fhes_common::types::{Address, ChainId};

use crate::error::{Result, WalletError};
use crate::registry::{DiscoveredProvider, ProviderRegistry};
use crate::session::{self, PersistedSessionRecord};

// ═══════════════════════════════════════════════════════════════════════════════
// CONNECTION STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// The process-wide wallet connection state.
///
/// Exactly one of these exists, owned by the [`WalletCoordinator`]; every
/// other component reads it through [`WalletCoordinator::state`] or the
/// watch channel.
#[derive(Clone, Debug)]
pub enum ConnectionState {
    /// No session. The resting state.
    Disconnected,
    /// An account request is in flight (silent or interactive).
    Connecting,
    /// A session is live.
    Connected {
        /// Active account (first entry of the wallet's account list).
        account: Address,
        /// Chain the session is bound to.
        chain_id: ChainId,
        /// Typed-data signing capability for the active account.
        signer: WalletSigner,
    },
    /// The last interactive connect failed. Accepts the same outgoing
    /// transitions as `Disconnected`.
    Error { cause: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn account(&self) -> Option<&Address> {
        match self {
            Self::Connected { account, .. } => Some(account),
            _ => None,
        }
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        match self {
            Self::Connected { chain_id, .. } => Some(*chain_id),
            _ => None,
        }
    }

    pub fn signer(&self) -> Option<&WalletSigner> {
        match self {
            Self::Connected { signer, .. } => Some(signer),
            _ => None,
        }
    }

    pub fn error_cause(&self) -> Option<&str> {
        match self {
            Self::Error { cause } => Some(cause),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WALLET COORDINATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Live event subscription to the active provider.
struct EventWiring {
    subscription: SubscriptionId,
    provider: Arc<dyn Eip1193Provider>,
    pump: JoinHandle<()>,
}

/// State shared between the coordinator handle and its event pump task.
struct SharedState {
    /// Current state; the watch channel is the single source of truth.
    state_tx: watch::Sender<ConnectionState>,
    /// Provider the current session runs on.
    active: RwLock<Option<DiscoveredProvider>>,
    /// Subscription to the active provider's events, if wired.
    wiring: Mutex<Option<EventWiring>>,
    /// Durable session record storage.
    store: Arc<dyn SessionStore>,
    /// Set once the single silent reconnect attempt has been consumed.
    reconnect_attempted: AtomicBool,
    /// Set while an interactive connect is in flight.
    connect_in_flight: AtomicBool,
}

impl SharedState {
    fn set_state(&self, next: ConnectionState) {
        tracing::debug!("wallet state -> {next:?}");
        self.state_tx.send_replace(next);
    }
}

/// The wallet connection coordinator.
///
/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct WalletCoordinator {
    registry: ProviderRegistry,
    shared: Arc<SharedState>,
}

impl WalletCoordinator {
    pub fn new(registry: ProviderRegistry, store: Arc<dyn SessionStore>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            registry,
            shared: Arc::new(SharedState {
                state_tx,
                active: RwLock::new(None),
                wiring: Mutex::new(None),
                store,
                reconnect_attempted: AtomicBool::new(false),
                connect_in_flight: AtomicBool::new(false),
            }),
        }
    }

    /// Snapshot of the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Observe every state change without polling.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Descriptor of the active provider, if any.
    pub async fn active_descriptor(&self) -> Option<ProviderDescriptor> {
        self.shared
            .active
            .read()
            .await
            .as_ref()
            .map(|d| d.descriptor.clone())
    }

    /// Try to restore the persisted session without prompting the user.
    ///
    /// Runs a real attempt at most once per process. The attempt is only
    /// consumed once a persisted record exists and its connector has been
    /// discovered; calls before that return `false` and leave the attempt
    /// available. An empty account answer means the wallet revoked access
    /// and clears the record; a transport failure keeps the record for the
    /// next launch. Returns whether the session is connected afterwards.
    pub async fn silent_reconnect(&self) -> bool {
        if self.shared.reconnect_attempted.load(Ordering::SeqCst) {
            return self.state().is_connected();
        }

        let Some(record) = session::load_record(self.shared.store.as_ref()).await else {
            return false;
        };
        let Some(discovered) = self.registry.get(&record.connector_id).await else {
            tracing::debug!(
                "silent reconnect deferred: connector {} not discovered yet",
                record.connector_id
            );
            return false;
        };
        if self.shared.reconnect_attempted.swap(true, Ordering::SeqCst) {
            return self.state().is_connected();
        }

        self.shared.set_state(ConnectionState::Connecting);
        match self.try_silent(&discovered, &record).await {
            Ok(()) => true,
            Err(e) => {
                let revoked = matches!(&e, WalletError::SilentReconnectFailed { revoked: true, .. });
                if revoked {
                    tracing::info!("silent reconnect: {e}; clearing session record");
                    if let Err(e) = session::clear_record(self.shared.store.as_ref()).await {
                        tracing::warn!("failed to clear session record: {e}");
                    }
                } else {
                    tracing::warn!("silent reconnect: {e}; keeping session record");
                }
                self.shared.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    /// Interactively connect to a provider (may prompt the user).
    ///
    /// `provider_id` selects a discovered provider by id; `None` takes the
    /// first one discovered. Only one call may be in flight; a second call
    /// while one is pending is a no-op and the earlier call's resolution
    /// governs the eventual state. On success the session is persisted; a
    /// storage failure during that persist is returned even though the live
    /// session remains usable.
    pub async fn connect(&self, provider_id: Option<&str>) -> Result<()> {
        if self.shared.connect_in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!("connect already in flight, ignoring");
            return Ok(());
        }

        let result = self.connect_inner(provider_id).await;
        self.shared.connect_in_flight.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => {}
            Err(WalletError::NoProviderAvailable) => {
                // Nothing was attempted; the registry is just empty.
            }
            Err(WalletError::Storage(_)) => {
                // The session is live; only its persistence failed.
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Error {
                    cause: e.to_string(),
                });
            }
        }
        result
    }

    /// Tear down the session and delete the persisted record.
    pub async fn disconnect(&self) -> Result<()> {
        self.teardown_wiring().await;
        *self.shared.active.write().await = None;
        self.shared.set_state(ConnectionState::Disconnected);
        session::clear_record(self.shared.store.as_ref()).await?;
        tracing::info!("wallet disconnected");
        Ok(())
    }

    // === Private helpers ===

    async fn connect_inner(&self, provider_id: Option<&str>) -> Result<()> {
        let discovered = match provider_id {
            Some(id) => self.registry.get(id).await,
            None => self.registry.first().await,
        }
        .ok_or(WalletError::NoProviderAvailable)?;

        // Abandon any live session before prompting for the new one, so no
        // listeners from the old provider survive into this attempt.
        self.teardown_wiring().await;
        *self.shared.active.write().await = None;
        self.shared.set_state(ConnectionState::Connecting);

        let accounts =
            request_accounts(discovered.provider.as_ref(), methods::ETH_REQUEST_ACCOUNTS)
                .await
                .map_err(|e| WalletError::ExplicitConnectFailed {
                    cause: e.to_string(),
                })?;
        let account = accounts
            .first()
            .cloned()
            .ok_or_else(|| WalletError::ExplicitConnectFailed {
                cause: "wallet returned no accounts".to_string(),
            })?;
        let chain_id = query_chain_id(discovered.provider.as_ref())
            .await
            .map_err(|e| WalletError::ExplicitConnectFailed {
                cause: e.to_string(),
            })?;

        self.activate(discovered.clone(), account.clone(), chain_id).await;
        tracing::info!(
            "wallet connected: {account} on chain {chain_id} via {}",
            discovered.descriptor.id
        );

        let record = PersistedSessionRecord {
            connector_id: discovered.descriptor.id.clone(),
            accounts,
            chain_id_hex: chain_id.to_hex(),
        };
        session::save_record(self.shared.store.as_ref(), &record).await?;
        Ok(())
    }

    async fn try_silent(
        &self,
        discovered: &DiscoveredProvider,
        record: &PersistedSessionRecord,
    ) -> Result<()> {
        let accounts = request_accounts(discovered.provider.as_ref(), methods::ETH_ACCOUNTS)
            .await
            .map_err(|e| WalletError::SilentReconnectFailed {
                cause: e.to_string(),
                revoked: false,
            })?;
        let Some(account) = accounts.first().cloned() else {
            return Err(WalletError::SilentReconnectFailed {
                cause: "wallet no longer authorizes any account".to_string(),
                revoked: true,
            });
        };

        let chain_id = match query_chain_id(discovered.provider.as_ref()).await {
            Ok(id) => id,
            // The wallet already re-authorized us; fall back to the chain the
            // record remembers rather than failing the whole restore.
            Err(e) => match record.chain_id() {
                Some(id) => {
                    tracing::debug!("chain id query failed ({e}), using recorded chain {id}");
                    id
                }
                None => {
                    return Err(WalletError::SilentReconnectFailed {
                        cause: e.to_string(),
                        revoked: false,
                    })
                }
            },
        };

        self.activate(discovered.clone(), account.clone(), chain_id).await;
        tracing::info!(
            "wallet session restored: {account} on chain {chain_id} via {}",
            discovered.descriptor.id
        );

        let record = PersistedSessionRecord {
            connector_id: discovered.descriptor.id.clone(),
            accounts,
            chain_id_hex: chain_id.to_hex(),
        };
        if let Err(e) = session::save_record(self.shared.store.as_ref(), &record).await {
            tracing::warn!("failed to refresh session record: {e}");
        }
        Ok(())
    }

    /// Make `discovered` the active provider and enter `Connected`.
    ///
    /// Tears down any previous wiring first so listeners never accumulate
    /// across reconnects.
    async fn activate(&self, discovered: DiscoveredProvider, account: Address, chain_id: ChainId) {
        self.teardown_wiring().await;

        let provider = Arc::clone(&discovered.provider);
        *self.shared.active.write().await = Some(discovered);
        self.wire_events(Arc::clone(&provider)).await;

        let signer = WalletSigner::new(provider, account.clone());
        self.shared.set_state(ConnectionState::Connected {
            account,
            chain_id,
            signer,
        });
    }

    /// Subscribe to the provider's events and start the pump task.
    async fn wire_events(&self, provider: Arc<dyn Eip1193Provider>) {
        let subscription = provider.subscribe();
        let sub_id = subscription.id;
        let mut events = subscription.events;

        let shared = Arc::clone(&self.shared);
        let pump_provider = Arc::clone(&provider);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if apply_event(&shared, event).await == EventOutcome::Stop {
                    break;
                }
            }
            release_wiring(&shared, sub_id, pump_provider).await;
        });

        *self.shared.wiring.lock().await = Some(EventWiring {
            subscription: sub_id,
            provider,
            pump,
        });
    }

    /// Abort the pump and drop the provider subscription, if one is wired.
    async fn teardown_wiring(&self) {
        let wiring = self.shared.wiring.lock().await.take();
        if let Some(w) = wiring {
            w.pump.abort();
            w.provider.unsubscribe(w.subscription);
        }
    }
}

impl ActiveProviderSource for WalletCoordinator {
    /// The provider backing the connected session, if one exists.
    ///
    /// Read through the state channel rather than the active slot so the
    /// answer is `Some` exactly while the state is `Connected`.
    fn active_provider(&self) -> Option<Arc<dyn Eip1193Provider>> {
        self.state().signer().map(|s| Arc::clone(s.provider()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT HANDLING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(PartialEq)]
enum EventOutcome {
    Continue,
    /// The session ended; the pump must release its own wiring and exit.
    Stop,
}

/// Apply one provider event to the shared state.
///
/// Runs on the pump task, so events are applied strictly in delivery order.
async fn apply_event(shared: &Arc<SharedState>, event: ProviderEvent) -> EventOutcome {
    match event {
        ProviderEvent::AccountsChanged(accounts) => {
            let Some(account) = accounts.first().cloned() else {
                tracing::info!("wallet revoked all accounts, disconnecting");
                if let Err(e) = session::clear_record(shared.store.as_ref()).await {
                    tracing::warn!("failed to clear session record: {e}");
                }
                *shared.active.write().await = None;
                shared.set_state(ConnectionState::Disconnected);
                return EventOutcome::Stop;
            };

            let current = shared.state_tx.borrow().clone();
            if let ConnectionState::Connected { chain_id, signer, .. } = current {
                let signer = WalletSigner::new(Arc::clone(signer.provider()), account.clone());
                repersist(shared, &accounts, chain_id).await;
                shared.set_state(ConnectionState::Connected {
                    account: account.clone(),
                    chain_id,
                    signer,
                });
                tracing::info!("active account changed to {account}");
            }
            EventOutcome::Continue
        }

        ProviderEvent::ChainChanged(new_chain) => {
            let current = shared.state_tx.borrow().clone();
            if let ConnectionState::Connected { account, signer, .. } = current {
                repersist(shared, std::slice::from_ref(&account), new_chain).await;
                shared.set_state(ConnectionState::Connected {
                    account,
                    chain_id: new_chain,
                    signer,
                });
                tracing::info!("active chain changed to {new_chain}");
            }
            EventOutcome::Continue
        }

        ProviderEvent::Connect { chain_id } => {
            // Emitted when the provider's upstream RPC link comes (back) up;
            // the session chain follows it.
            let current = shared.state_tx.borrow().clone();
            if let ConnectionState::Connected { account, signer, .. } = current {
                shared.set_state(ConnectionState::Connected {
                    account,
                    chain_id,
                    signer,
                });
            } else {
                tracing::debug!("provider link up on chain {chain_id}");
            }
            EventOutcome::Continue
        }

        ProviderEvent::Disconnect { code, message } => {
            // The provider ended the session; same teardown as an explicit
            // disconnect call, persisted record included.
            tracing::warn!("provider disconnected (code {code}): {message}");
            if let Err(e) = session::clear_record(shared.store.as_ref()).await {
                tracing::warn!("failed to clear session record: {e}");
            }
            *shared.active.write().await = None;
            shared.set_state(ConnectionState::Disconnected);
            EventOutcome::Stop
        }
    }
}

/// Refresh the persisted record after an account or chain change.
async fn repersist(shared: &Arc<SharedState>, accounts: &[Address], chain_id: ChainId) {
    let connector_id = {
        let active = shared.active.read().await;
        match active.as_ref() {
            Some(d) => d.descriptor.id.clone(),
            None => return,
        }
    };
    let record = PersistedSessionRecord {
        connector_id,
        accounts: accounts.to_vec(),
        chain_id_hex: chain_id.to_hex(),
    };
    if let Err(e) = session::save_record(shared.store.as_ref(), &record).await {
        tracing::warn!("failed to refresh session record: {e}");
    }
}

/// Pump-side wiring release, for when the event loop ends on its own.
///
/// Only clears the wiring slot if it still holds this pump's subscription;
/// a newer session may already have re-wired it.
async fn release_wiring(
    shared: &Arc<SharedState>,
    sub_id: SubscriptionId,
    provider: Arc<dyn Eip1193Provider>,
) {
    {
        let mut wiring = shared.wiring.lock().await;
        if wiring.as_ref().map(|w| w.subscription) == Some(sub_id) {
            wiring.take();
        }
    }
    provider.unsubscribe(sub_id);
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

async fn request_accounts(provider: &dyn Eip1193Provider, method: &str) -> Result<Vec<Address>> {
    let value = provider.request(method, serde_json::Value::Null).await?;
    let entries = value.as_array().ok_or_else(|| {
        WalletError::Rpc(RpcError::InvalidResponse(format!(
            "account list is not an array: {value}"
        )))
    })?;

    let mut accounts = Vec::with_capacity(entries.len());
    for entry in entries {
        let raw = entry.as_str().ok_or_else(|| {
            WalletError::Rpc(RpcError::InvalidResponse(
                "account entry is not a string".to_string(),
            ))
        })?;
        accounts.push(Address::parse(raw)?);
    }
    Ok(accounts)
}

async fn query_chain_id(provider: &dyn Eip1193Provider) -> Result<ChainId> {
    let value = provider
        .request(methods::ETH_CHAIN_ID, serde_json::Value::Null)
        .await?;
    let raw = value.as_str().ok_or_else(|| {
        WalletError::Rpc(RpcError::InvalidResponse(format!(
            "chain id is not a string: {value}"
        )))
    })?;
    Ok(ChainId::from_hex(raw)?)
}
