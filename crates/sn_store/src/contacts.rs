//! Contact-secret store.
//!
//! A contact secret is everything needed to (re)open the secure conversation
//! with one peer endpoint: the conversation token, the optional `dr_init`
//! bootstrap blob and the profile fields the peer shared. The in-memory map
//! is the working set; MK-wrapped blobs of it are cached locally and synced
//! through the wrapped remote backup so a fresh device can hydrate every DR
//! session after unlock.
//!
//! Pending invites (outstanding invite secrets we issued) are bounded; the
//! oldest entry is dropped with a trace when the cap trips.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use sn_crypto::envelope::{self, SealedEnvelope, INFO_BACKUP};
use sn_crypto::identity::{AccountDigest, PeerKey};
use sn_crypto::x3dh::DrInit;

use crate::error::StoreError;

pub const MAX_PENDING_INVITES: usize = 50;

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSecret {
    pub conversation_id: String,
    pub token_b64: String,
    pub peer_account_digest: AccountDigest,
    pub peer_device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dr_init: Option<DrInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub added_at: DateTime<Utc>,
    pub profile_updated_at: DateTime<Utc>,
}

impl ContactSecret {
    pub fn peer_key(&self) -> PeerKey {
        PeerKey::new(self.peer_account_digest.clone(), self.peer_device_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInvite {
    pub invite_id: String,
    pub secret_b64: String,
    pub peer_account_digest: Option<AccountDigest>,
    pub peer_device_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Serialized form of the whole store, the unit that gets MK-wrapped.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ContactSecretsBlob {
    pub v: u8,
    pub secrets: Vec<ContactSecret>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// Incoming `profile_updated_at` was not strictly newer.
    SkippedStale,
}

// ── Store ────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct ContactSecretStore {
    secrets: Arc<RwLock<HashMap<PeerKey, ContactSecret>>>,
    pending: Arc<RwLock<Vec<PendingInvite>>>,
}

impl ContactSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, peer: &PeerKey) -> Option<ContactSecret> {
        self.secrets.read().await.get(peer).cloned()
    }

    pub async fn all(&self) -> Vec<ContactSecret> {
        self.secrets.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.secrets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.secrets.read().await.is_empty()
    }

    /// Writer-wins on strictly newer `profile_updated_at`; equal or older
    /// incoming timestamps leave the stored entry untouched.
    pub async fn upsert(&self, secret: ContactSecret) -> UpsertOutcome {
        let peer = secret.peer_key();
        let mut secrets = self.secrets.write().await;
        if let Some(existing) = secrets.get(&peer) {
            if secret.profile_updated_at <= existing.profile_updated_at {
                return UpsertOutcome::SkippedStale;
            }
        }
        secrets.insert(peer, secret);
        UpsertOutcome::Applied
    }

    pub async fn remove(&self, peer: &PeerKey) -> Option<ContactSecret> {
        self.secrets.write().await.remove(peer)
    }

    pub async fn remove_by_account(&self, digest: &AccountDigest) {
        self.secrets
            .write()
            .await
            .retain(|k, _| k.digest() != digest);
    }

    // ── Pending invites ──────────────────────────────────────────────────

    pub async fn add_pending_invite(&self, invite: PendingInvite) {
        let mut pending = self.pending.write().await;
        if pending.len() >= MAX_PENDING_INVITES {
            let dropped = pending.remove(0);
            tracing::warn!(
                target: "sn_store",
                event = "pending_invite_dropped",
                invite_id = %dropped.invite_id,
                reason = "capacity"
            );
        }
        pending.push(invite);
    }

    pub async fn pending_invites(&self) -> Vec<PendingInvite> {
        self.pending.read().await.clone()
    }

    pub async fn take_pending_invite(&self, invite_id: &str) -> Option<PendingInvite> {
        let mut pending = self.pending.write().await;
        let idx = pending.iter().position(|p| p.invite_id == invite_id)?;
        Some(pending.remove(idx))
    }

    /// Drop any invites that were waiting on this endpoint — the
    /// contact-share that just applied supersedes them.
    pub async fn drop_pending_for(&self, digest: &AccountDigest, device_id: &str) -> usize {
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|p| {
            !(p.peer_account_digest.as_ref() == Some(digest)
                && p.peer_device_id.as_deref() == Some(device_id))
        });
        before - pending.len()
    }

    // ── Wrapped blob import/export ───────────────────────────────────────

    /// MK-wrapped export of the full secret map for the local cache and the
    /// remote backup.
    pub async fn export_wrapped(&self, master_key: &[u8; 32]) -> Result<SealedEnvelope, StoreError> {
        let blob = ContactSecretsBlob {
            v: 2,
            secrets: self.all().await,
        };
        Ok(envelope::wrap_json(&blob, master_key, INFO_BACKUP)?)
    }

    /// Merge a wrapped blob into the store. Returns how many entries were
    /// applied (stale ones are skipped by the monotone rule).
    pub async fn import_wrapped(
        &self,
        env: &SealedEnvelope,
        master_key: &[u8; 32],
    ) -> Result<usize, StoreError> {
        let blob: ContactSecretsBlob = envelope::unwrap_json(env, master_key, &[INFO_BACKUP])?;
        let mut applied = 0;
        for secret in blob.secrets {
            if self.upsert(secret).await == UpsertOutcome::Applied {
                applied += 1;
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "00112233445566778899AABBCCDDEEFF00112233445566778899AABBCCDDEEFF";

    fn secret(device: &str, updated_secs_ago: i64) -> ContactSecret {
        ContactSecret {
            conversation_id: "conv".into(),
            token_b64: "dG9r".into(),
            peer_account_digest: AccountDigest::parse(PEER).unwrap(),
            peer_device_id: device.into(),
            dr_init: None,
            nickname: Some("peer".into()),
            avatar: None,
            added_at: Utc::now(),
            profile_updated_at: Utc::now() - chrono::Duration::seconds(updated_secs_ago),
        }
    }

    #[tokio::test]
    async fn upsert_is_monotone_on_profile_timestamp() {
        let store = ContactSecretStore::new();
        let newer = secret("dev-1", 0);
        let older = secret("dev-1", 60);

        assert_eq!(store.upsert(newer.clone()).await, UpsertOutcome::Applied);
        assert_eq!(store.upsert(older).await, UpsertOutcome::SkippedStale);
        // Equal timestamp also skips.
        assert_eq!(store.upsert(newer).await, UpsertOutcome::SkippedStale);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn export_import_roundtrip() {
        let mk = [0x11u8; 32];
        let store = ContactSecretStore::new();
        store.upsert(secret("dev-1", 0)).await;
        store.upsert(secret("dev-2", 0)).await;

        let env = store.export_wrapped(&mk).await.unwrap();

        let fresh = ContactSecretStore::new();
        let applied = fresh.import_wrapped(&env, &mk).await.unwrap();
        assert_eq!(applied, 2);
        assert_eq!(fresh.len().await, 2);
    }

    #[tokio::test]
    async fn pending_invites_bounded() {
        let store = ContactSecretStore::new();
        for i in 0..(MAX_PENDING_INVITES + 3) {
            store
                .add_pending_invite(PendingInvite {
                    invite_id: format!("inv-{i}"),
                    secret_b64: "cw==".into(),
                    peer_account_digest: None,
                    peer_device_id: None,
                    created_at: Utc::now(),
                })
                .await;
        }
        let pending = store.pending_invites().await;
        assert_eq!(pending.len(), MAX_PENDING_INVITES);
        // Oldest dropped first.
        assert_eq!(pending[0].invite_id, "inv-3");
    }

    #[tokio::test]
    async fn drop_pending_for_endpoint() {
        let store = ContactSecretStore::new();
        store
            .add_pending_invite(PendingInvite {
                invite_id: "inv-a".into(),
                secret_b64: "cw==".into(),
                peer_account_digest: Some(AccountDigest::parse(PEER).unwrap()),
                peer_device_id: Some("dev-1".into()),
                created_at: Utc::now(),
            })
            .await;
        store
            .add_pending_invite(PendingInvite {
                invite_id: "inv-b".into(),
                secret_b64: "cw==".into(),
                peer_account_digest: None,
                peer_device_id: None,
                created_at: Utc::now(),
            })
            .await;

        let dropped = store
            .drop_pending_for(&AccountDigest::parse(PEER).unwrap(), "dev-1")
            .await;
        assert_eq!(dropped, 1);
        assert_eq!(store.pending_invites().await.len(), 1);
    }
}
