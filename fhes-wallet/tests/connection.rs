//! End-to-end tests for the wallet connection state machine against an
//! in-process provider double.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::sync::Notify;

use fhes_common::provider::{
    ActiveProviderSource, Eip1193Provider, EventHub, ProviderDescriptor, ProviderEvent,
    ProviderSubscription, RpcError, SubscriptionId, USER_REJECTED_CODE,
};
use fhes_common::storage::MemoryStore;
use fhes_common::types::{Address, ChainId};
use fhes_wallet::session::{self, PersistedSessionRecord};
use fhes_wallet::{ConnectionState, ProviderRegistry, WalletCoordinator, WalletError};

const WALLET_ID: &str = "io.wallet.example";
const OTHER_WALLET_ID: &str = "io.wallet.other";
const ACCOUNT_A: &str = "0xaaaabbbbccccddddeeeeffff0000111122223333";
const ACCOUNT_B: &str = "0x9999888877776666555544443333222211110000";
const LOCAL_CHAIN_HEX: &str = "0x7a69";

// ═══════════════════════════════════════════════════════════════════════════════
// PROVIDER DOUBLE
// ═══════════════════════════════════════════════════════════════════════════════

struct MockProvider {
    hub: EventHub,
    accounts: Mutex<Vec<String>>,
    chain_hex: Mutex<String>,
    silent_calls: AtomicUsize,
    interactive_calls: AtomicUsize,
    fail_transport: AtomicBool,
    reject_interactive: AtomicBool,
    interactive_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockProvider {
    fn new(accounts: &[&str], chain_hex: &str) -> Arc<Self> {
        Arc::new(Self {
            hub: EventHub::new(),
            accounts: Mutex::new(accounts.iter().map(|s| s.to_string()).collect()),
            chain_hex: Mutex::new(chain_hex.to_string()),
            silent_calls: AtomicUsize::new(0),
            interactive_calls: AtomicUsize::new(0),
            fail_transport: AtomicBool::new(false),
            reject_interactive: AtomicBool::new(false),
            interactive_gate: Mutex::new(None),
        })
    }

    fn set_accounts(&self, accounts: &[&str]) {
        *self.accounts.lock().unwrap() = accounts.iter().map(|s| s.to_string()).collect();
    }

    /// Make the next interactive request block until the returned gate is
    /// notified, simulating an open wallet prompt.
    fn gate_interactive(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.interactive_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn emit(&self, event: ProviderEvent) {
        self.hub.emit(event);
    }

    fn listener_count(&self) -> usize {
        self.hub.subscriber_count()
    }
}

#[async_trait]
impl Eip1193Provider for MockProvider {
    async fn request(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("connection refused".to_string()));
        }
        match method {
            "eth_accounts" => {
                self.silent_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(self.accounts.lock().unwrap().clone()))
            }
            "eth_requestAccounts" => {
                self.interactive_calls.fetch_add(1, Ordering::SeqCst);
                let gate = self.interactive_gate.lock().unwrap().clone();
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                if self.reject_interactive.load(Ordering::SeqCst) {
                    return Err(RpcError::Rejected {
                        code: USER_REJECTED_CODE,
                        message: "User rejected the request".to_string(),
                    });
                }
                Ok(json!(self.accounts.lock().unwrap().clone()))
            }
            "eth_chainId" => Ok(json!(self.chain_hex.lock().unwrap().clone())),
            "eth_signTypedData_v4" => Ok(json!("0xfeedface")),
            other => Err(RpcError::Transport(format!("unsupported method {other}"))),
        }
    }

    fn subscribe(&self) -> ProviderSubscription {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.hub.unsubscribe(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FIXTURES
// ═══════════════════════════════════════════════════════════════════════════════

fn addr(raw: &str) -> Address {
    Address::parse(raw).unwrap()
}

fn descriptor(id: &str) -> ProviderDescriptor {
    ProviderDescriptor::new(id, "Example Wallet", "data:image/svg+xml,<svg/>")
}

async fn registry_with(id: &str, provider: Arc<MockProvider>) -> ProviderRegistry {
    let registry = ProviderRegistry::new();
    registry.announce(descriptor(id), provider).await;
    registry
}

fn saved_record() -> PersistedSessionRecord {
    PersistedSessionRecord {
        connector_id: WALLET_ID.to_string(),
        accounts: vec![addr(ACCOUNT_A)],
        chain_id_hex: LOCAL_CHAIN_HEX.to_string(),
    }
}

async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    pred: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            {
                let state = rx.borrow_and_update().clone();
                if pred(&state) {
                    return state;
                }
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("timed out waiting for state")
}

async fn wait_until(pred: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXPLICIT CONNECT
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connect_with_no_providers_reports_no_provider() {
    let coordinator = WalletCoordinator::new(ProviderRegistry::new(), Arc::new(MemoryStore::new()));

    let err = coordinator.connect(None).await.unwrap_err();
    assert!(matches!(err, WalletError::NoProviderAvailable));
    assert!(matches!(coordinator.state(), ConnectionState::Disconnected));
}

#[tokio::test]
async fn explicit_connect_establishes_and_persists_session() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    let coordinator = WalletCoordinator::new(registry, Arc::new(store.clone()));

    coordinator.connect(None).await.unwrap();

    let state = coordinator.state();
    assert_eq!(state.account(), Some(&addr(ACCOUNT_A)));
    assert_eq!(state.chain_id(), Some(ChainId(31337)));
    assert_eq!(provider.interactive_calls.load(Ordering::SeqCst), 1);

    let record = session::load_record(&store).await.expect("record persisted");
    assert_eq!(record, saved_record());
    assert_eq!(
        coordinator.active_descriptor().await.map(|d| d.id),
        Some(WALLET_ID.to_string())
    );
}

#[tokio::test]
async fn concurrent_connect_calls_prompt_once() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let coordinator = WalletCoordinator::new(registry, Arc::new(MemoryStore::new()));

    let gate = provider.gate_interactive();
    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.connect(None).await })
    };

    // Wait until the first call is sitting in the wallet prompt.
    let p = provider.clone();
    wait_until(move || p.interactive_calls.load(Ordering::SeqCst) == 1).await;

    // A second call while one is pending must not open another prompt.
    coordinator.connect(None).await.unwrap();
    assert_eq!(provider.interactive_calls.load(Ordering::SeqCst), 1);

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert!(coordinator.state().is_connected());
}

#[tokio::test]
async fn user_rejection_surfaces_error_and_allows_retry() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let coordinator = WalletCoordinator::new(registry, Arc::new(MemoryStore::new()));

    provider.reject_interactive.store(true, Ordering::SeqCst);
    let err = coordinator.connect(None).await.unwrap_err();
    assert!(matches!(err, WalletError::ExplicitConnectFailed { .. }));
    let cause = coordinator.state().error_cause().unwrap_or_default().to_string();
    assert!(cause.contains("rejected"), "unexpected cause: {cause}");

    // The error state accepts a fresh attempt.
    provider.reject_interactive.store(false, Ordering::SeqCst);
    coordinator.connect(None).await.unwrap();
    assert!(coordinator.state().is_connected());
}

#[tokio::test]
async fn switching_providers_removes_old_listeners() {
    let first = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let second = MockProvider::new(&[ACCOUNT_B], "0x1");
    let registry = registry_with(WALLET_ID, first.clone()).await;
    registry.announce(descriptor(OTHER_WALLET_ID), second.clone()).await;
    let coordinator = WalletCoordinator::new(registry, Arc::new(MemoryStore::new()));

    coordinator.connect(Some(WALLET_ID)).await.unwrap();
    assert_eq!(first.listener_count(), 1);

    coordinator.connect(Some(OTHER_WALLET_ID)).await.unwrap();
    assert_eq!(first.listener_count(), 0);
    assert_eq!(second.listener_count(), 1);
    assert_eq!(coordinator.state().account(), Some(&addr(ACCOUNT_B)));
}

// ═══════════════════════════════════════════════════════════════════════════════
// SILENT RECONNECT
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn silent_reconnect_restores_session_without_prompting() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    session::save_record(&store, &saved_record()).await.unwrap();
    let coordinator = WalletCoordinator::new(registry, Arc::new(store.clone()));

    assert!(coordinator.silent_reconnect().await);

    let state = coordinator.state();
    assert_eq!(state.account(), Some(&addr(ACCOUNT_A)));
    assert_eq!(state.chain_id(), Some(ChainId(31337)));
    assert_eq!(provider.silent_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.interactive_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn silent_reconnect_runs_at_most_once() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    session::save_record(&store, &saved_record()).await.unwrap();
    let coordinator = WalletCoordinator::new(registry.clone(), Arc::new(store));

    assert!(coordinator.silent_reconnect().await);

    // Re-announcing does not reopen the attempt.
    registry.announce(descriptor(WALLET_ID), provider.clone()).await;
    assert!(coordinator.silent_reconnect().await);
    assert_eq!(provider.silent_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_record_preserves_the_reconnect_attempt() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    let coordinator = WalletCoordinator::new(registry, Arc::new(store.clone()));

    // Nothing persisted yet: no query is spent.
    assert!(!coordinator.silent_reconnect().await);
    assert_eq!(provider.silent_calls.load(Ordering::SeqCst), 0);

    // Once a record exists, the one attempt is still available.
    session::save_record(&store, &saved_record()).await.unwrap();
    assert!(coordinator.silent_reconnect().await);
    assert!(coordinator.state().is_connected());
}

#[tokio::test]
async fn revoked_reconnect_clears_the_record() {
    let provider = MockProvider::new(&[], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    session::save_record(&store, &saved_record()).await.unwrap();
    let coordinator = WalletCoordinator::new(registry, Arc::new(store.clone()));

    assert!(!coordinator.silent_reconnect().await);
    assert!(matches!(coordinator.state(), ConnectionState::Disconnected));
    assert!(session::load_record(&store).await.is_none());
}

#[tokio::test]
async fn transport_failure_during_reconnect_keeps_the_record() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    provider.fail_transport.store(true, Ordering::SeqCst);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    session::save_record(&store, &saved_record()).await.unwrap();
    let coordinator = WalletCoordinator::new(registry, Arc::new(store.clone()));

    assert!(!coordinator.silent_reconnect().await);
    assert!(matches!(coordinator.state(), ConnectionState::Disconnected));

    // A momentary RPC hiccup is not a revocation; the next launch may retry.
    assert!(session::load_record(&store).await.is_some());
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROVIDER EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn empty_accounts_event_disconnects_and_clears_record() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    let coordinator = WalletCoordinator::new(registry, Arc::new(store.clone()));
    coordinator.connect(None).await.unwrap();

    let mut states = coordinator.watch_state();
    provider.emit(ProviderEvent::AccountsChanged(vec![]));

    let state = wait_for_state(&mut states, |s| !s.is_connected()).await;
    assert!(matches!(state, ConnectionState::Disconnected));
    assert!(session::load_record(&store).await.is_none());

    let p = provider.clone();
    wait_until(move || p.listener_count() == 0).await;
}

#[tokio::test]
async fn account_change_updates_state_and_record() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    let coordinator = WalletCoordinator::new(registry, Arc::new(store.clone()));
    coordinator.connect(None).await.unwrap();

    let mut states = coordinator.watch_state();
    provider.set_accounts(&[ACCOUNT_B]);
    provider.emit(ProviderEvent::AccountsChanged(vec![addr(ACCOUNT_B)]));

    let state = wait_for_state(&mut states, |s| s.account() == Some(&addr(ACCOUNT_B))).await;
    assert_eq!(state.chain_id(), Some(ChainId(31337)));

    let record = session::load_record(&store).await.expect("record refreshed");
    assert_eq!(record.accounts, vec![addr(ACCOUNT_B)]);
}

#[tokio::test]
async fn chain_change_updates_chain_in_place() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    let coordinator = WalletCoordinator::new(registry, Arc::new(store.clone()));
    coordinator.connect(None).await.unwrap();

    let mut states = coordinator.watch_state();
    provider.emit(ProviderEvent::ChainChanged(ChainId(1)));

    let state = wait_for_state(&mut states, |s| s.chain_id() == Some(ChainId(1))).await;
    assert_eq!(state.account(), Some(&addr(ACCOUNT_A)));

    let record = session::load_record(&store).await.expect("record refreshed");
    assert_eq!(record.chain_id_hex, "0x1");
}

#[tokio::test]
async fn provider_disconnect_event_tears_down_like_explicit_disconnect() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    let coordinator = WalletCoordinator::new(registry, Arc::new(store.clone()));
    coordinator.connect(None).await.unwrap();
    assert!(session::load_record(&store).await.is_some());

    let mut states = coordinator.watch_state();
    provider.emit(ProviderEvent::Disconnect {
        code: 4900,
        message: "chain unreachable".to_string(),
    });

    let state = wait_for_state(&mut states, |s| !s.is_connected()).await;
    assert!(matches!(state, ConnectionState::Disconnected));
    assert!(session::load_record(&store).await.is_none());

    let p = provider.clone();
    wait_until(move || p.listener_count() == 0).await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISCONNECT
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn disconnect_clears_session_and_record() {
    let provider = MockProvider::new(&[ACCOUNT_A], LOCAL_CHAIN_HEX);
    let registry = registry_with(WALLET_ID, provider.clone()).await;
    let store = MemoryStore::new();
    let coordinator = WalletCoordinator::new(registry, Arc::new(store.clone()));
    coordinator.connect(None).await.unwrap();
    assert_eq!(provider.listener_count(), 1);

    coordinator.disconnect().await.unwrap();

    assert!(matches!(coordinator.state(), ConnectionState::Disconnected));
    assert!(coordinator.active_provider().is_none());
    assert!(session::load_record(&store).await.is_none());
    assert_eq!(provider.listener_count(), 0);
}
