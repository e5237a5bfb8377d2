//! The consolidated `Session` value.
//!
//! Everything that used to be ambient — master key, account identity,
//! session maps, vault client, transport — lives behind one explicitly
//! passed handle. Tests instantiate isolated sessions over in-memory fakes;
//! nothing in the engine reaches for globals.

use std::sync::Arc;
use std::time::Duration;

use sn_crypto::identity::PeerKey;
use sn_proto::packet::SelfIdentity;
use sn_store::{
    contacts::{ContactSecret, ContactSecretStore},
    vault::VaultTransport,
    Keyring, LocalCache, MessageKeyVault, SessionStore,
};

use crate::{
    error::{EngineError, ErrorKind},
    events::EventBus,
    fetch_lock::FetchLockMap,
    transport::MessageTransport,
};

// ── Tunables ─────────────────────────────────────────────────────────────────

/// Retry/backoff policy. Every scheduled delay is clamped to `delay_cap`
/// (runaway-timer guard); tests shrink all of these to milliseconds.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub live_retry_max: u32,
    pub live_backoff: Vec<Duration>,
    pub delay_cap: Duration,
    pub gap_retry_max: u32,
    pub gap_retry_interval: Duration,
    /// Wall-clock cap on non-counting network-failure waits.
    pub offline_wait_cap: Duration,
    /// Restore stage 4: skip eager gap drain when the newest key is not
    /// vaulted, surfacing an unread count instead.
    pub lazy_restore: bool,
    /// Send a `control/receipt` back after committing an incoming user
    /// message.
    pub delivery_receipts: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            live_retry_max: 3,
            live_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
            delay_cap: Duration::from_secs(10),
            gap_retry_max: 3,
            gap_retry_interval: Duration::from_secs(2),
            offline_wait_cap: Duration::from_secs(300),
            lazy_restore: false,
            delivery_receipts: false,
        }
    }
}

impl EngineConfig {
    /// Millisecond-scale variant for tests.
    pub fn fast() -> Self {
        Self {
            live_backoff: vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4),
            ],
            delay_cap: Duration::from_millis(50),
            gap_retry_interval: Duration::from_millis(2),
            offline_wait_cap: Duration::from_millis(20),
            ..Self::default()
        }
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let d = self
            .live_backoff
            .get(attempt as usize)
            .copied()
            .or_else(|| self.live_backoff.last().copied())
            .unwrap_or(Duration::from_secs(1));
        d.min(self.delay_cap)
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct Session {
    pub keyring: Keyring,
    pub sessions: SessionStore,
    pub vault: MessageKeyVault,
    pub contacts: ContactSecretStore,
    pub cache: Option<LocalCache>,
    pub api: Arc<dyn MessageTransport>,
    pub events: EventBus,
    pub fetch_locks: FetchLockMap,
    pub config: EngineConfig,
}

impl Session {
    pub fn new(
        api: Arc<dyn MessageTransport>,
        vault_transport: Arc<dyn VaultTransport>,
        cache: Option<LocalCache>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            keyring: Keyring::new(),
            sessions: SessionStore::new(),
            vault: MessageKeyVault::new(vault_transport),
            contacts: ContactSecretStore::new(),
            cache,
            api,
            events: EventBus::new(),
            fetch_locks: FetchLockMap::new(),
            config,
        })
    }

    /// Identity triple used by the pipeline to resolve packet direction.
    pub async fn self_identity(&self) -> Result<SelfIdentity, EngineError> {
        Ok(SelfIdentity {
            account_digest: self.keyring.account_digest().await?,
            device_id: self.keyring.device_id().await?,
        })
    }

    /// Secure-conversation readiness: a contact secret (conversation token)
    /// must exist for the endpoint before any ratchet work is attempted.
    pub async fn require_secure_ready(&self, peer: &PeerKey) -> Result<ContactSecret, EngineError> {
        self.contacts.get(peer).await.ok_or_else(|| {
            EngineError::new(
                ErrorKind::SecurePending,
                "no contact secret for peer yet",
            )
            .with_peer(peer)
        })
    }

    /// Find the contact secret for a conversation + sender device, for
    /// packets that arrive without a sender digest.
    pub async fn contact_for_conversation(
        &self,
        conversation_id: &str,
        sender_device_id: &str,
    ) -> Option<ContactSecret> {
        self.contacts
            .all()
            .await
            .into_iter()
            .find(|s| s.conversation_id == conversation_id && s.peer_device_id == sender_device_id)
    }
}
