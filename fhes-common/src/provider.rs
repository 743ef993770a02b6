//! Wallet provider capability surface.
//!
//! A provider is the injected wallet's capability object: a request/response
//! RPC channel plus an event emitter. Environments adapt whatever transport
//! they have (extension bridge, IPC, test double) to [`Eip1193Provider`];
//! everything above this trait only ever sees the trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Address, ChainId};

/// RPC methods this toolkit issues against a provider.
pub mod methods {
    /// Non-interactive account listing. Never prompts.
    pub const ETH_ACCOUNTS: &str = "eth_accounts";
    /// Interactive account request. May prompt the user.
    pub const ETH_REQUEST_ACCOUNTS: &str = "eth_requestAccounts";
    /// Active chain id as a hex quantity.
    pub const ETH_CHAIN_ID: &str = "eth_chainId";
    /// Typed-data signature request.
    pub const ETH_SIGN_TYPED_DATA_V4: &str = "eth_signTypedData_v4";
}

/// EIP-1193 code for a user-rejected request.
pub const USER_REJECTED_CODE: i64 = 4001;

// ═══════════════════════════════════════════════════════════════════════════════
// DESCRIPTOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity a provider announces about itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    /// Stable reverse-domain identifier, e.g. `io.metamask`.
    pub id: String,
    /// Human-readable wallet name.
    pub display_name: String,
    /// Icon reference (data URI or URL).
    pub icon: String,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, icon: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            icon: icon.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures surfaced by a provider `request` call.
#[derive(Clone, Debug, Error)]
pub enum RpcError {
    /// The transport itself failed; nothing reached the wallet.
    #[error("provider transport failure: {0}")]
    Transport(String),

    /// The wallet answered with an error (including user rejection).
    #[error("provider rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// The wallet answered, but not in the shape the method promises.
    #[error("malformed provider response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// Whether the user explicitly declined the request.
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code == USER_REJECTED_CODE)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Out-of-band notifications a provider emits.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderEvent {
    /// The authorized account list changed. Empty means access was revoked.
    AccountsChanged(Vec<Address>),
    /// The active chain changed.
    ChainChanged(ChainId),
    /// The provider (re)established its upstream connection.
    Connect { chain_id: ChainId },
    /// The provider lost its upstream connection.
    Disconnect { code: i64, message: String },
}

/// Opaque handle identifying one event subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A live subscription: the id to tear it down with, plus the event stream.
pub struct ProviderSubscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<ProviderEvent>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPABILITY TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// The wallet provider capability consumed by the session toolkit.
#[async_trait]
pub trait Eip1193Provider: Send + Sync {
    /// Issue an RPC request. `params` is the positional parameter array
    /// (or `Value::Null` for none).
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    /// Register for the provider's event stream.
    fn subscribe(&self) -> ProviderSubscription;

    /// Tear down a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Answers "which provider is active right now", if any.
///
/// Components that outlive individual wallet sessions (instance managers,
/// decryption flows) hold one of these instead of a provider, so they follow
/// wallet switches automatically. The answer may change between calls.
pub trait ActiveProviderSource: Send + Sync {
    fn active_provider(&self) -> Option<Arc<dyn Eip1193Provider>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNER
// ═══════════════════════════════════════════════════════════════════════════════

/// Typed-data signing capability bound to one connected account.
///
/// A thin pairing of a provider with the account that signs. The decryption
/// grant flow consumes this without knowing anything about sessions.
#[derive(Clone)]
pub struct WalletSigner {
    provider: Arc<dyn Eip1193Provider>,
    account: Address,
}

impl WalletSigner {
    pub fn new(provider: Arc<dyn Eip1193Provider>, account: Address) -> Self {
        Self { provider, account }
    }

    /// The account signatures are produced for.
    pub fn account(&self) -> &Address {
        &self.account
    }

    pub fn provider(&self) -> &Arc<dyn Eip1193Provider> {
        &self.provider
    }

    /// Request an EIP-712 signature over `typed_data` from the wallet.
    ///
    /// Params follow `eth_signTypedData_v4`: the signing address first, the
    /// typed-data document serialized as a JSON string second.
    pub async fn sign_typed_data(&self, typed_data: &Value) -> Result<String, RpcError> {
        let params = serde_json::json!([self.account.to_checksum(), typed_data.to_string()]);
        let result = self
            .provider
            .request(methods::ETH_SIGN_TYPED_DATA_V4, params)
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::InvalidResponse(format!("signature is not a string: {result}")))
    }
}

impl std::fmt::Debug for WalletSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSigner")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT HUB
// ═══════════════════════════════════════════════════════════════════════════════

/// Subscription bookkeeping shared by provider implementations.
///
/// Adapters hold one hub, forward wallet events into [`EventHub::emit`], and
/// delegate `subscribe`/`unsubscribe` to it.
#[derive(Default)]
pub struct EventHub {
    inner: std::sync::Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<ProviderEvent>)>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> ProviderSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.subscribers.push((id, tx));
        ProviderSubscription { id, events: rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Fan an event out to every live subscriber, pruning closed ones.
    pub fn emit(&self, event: ProviderEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscriptions. Lets tests assert listener hygiene.
    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.len()
    }
}
