//! Message Key Vault — server-backed, MK-wrapped per-message key store.
//!
//! One entry per `(conversationId, messageId, senderDeviceId)`, holding the
//! message key wrapped under the Master Key (info `message-key/v1`) and,
//! optionally, an MK-wrapped DR state snapshot. The server indexes on the
//! routing triple and a deterministic wrap digest; it never sees a key.
//!
//! Contracts (the delivery pipeline leans on all three):
//!   - `put` is idempotent: the same triple with the same key bytes comes
//!     back `duplicate:true` and the stored blob is untouched.
//!   - a re-put with *different* key bytes is a conflict and surfaces as an
//!     integrity error — that slot is already spoken for.
//!   - `latest_state` is the authoritative local-processed counter; DR
//!     counters may only advance once the vault holds the key durably.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use sn_crypto::envelope::{self, SealedEnvelope, INFO_DR_STATE, INFO_MESSAGE_KEY};
use sn_crypto::identity::PeerKey;
use sn_crypto::ratchet::DrState;
use sn_proto::api::{
    VaultGetRequest, VaultGetResponse, VaultLatestStateResponse, VaultPutRequest,
    VaultPutResponse,
};
use sn_proto::packet::Direction;

use crate::error::StoreError;

const KEY_CACHE_CAPACITY: usize = 400;

// ── Transport ────────────────────────────────────────────────────────────────

/// Server side of the vault. Implemented over HTTP by the engine and by
/// in-memory fakes in tests.
#[async_trait]
pub trait VaultTransport: Send + Sync {
    async fn put(&self, req: VaultPutRequest) -> Result<VaultPutResponse, StoreError>;
    async fn get(&self, req: VaultGetRequest) -> Result<VaultGetResponse, StoreError>;
    async fn delete(&self, req: VaultGetRequest) -> Result<(), StoreError>;
    async fn latest_state(
        &self,
        conversation_id: &str,
        sender_device_id: &str,
    ) -> Result<VaultLatestStateResponse, StoreError>;
}

// ── Wrapped record ───────────────────────────────────────────────────────────

/// Context sealed next to the key so an unwrapped record proves which slot
/// it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapContext {
    pub version: u8,
    pub conversation_id: String,
    pub message_id: String,
    pub sender_device_id: String,
    pub target_device_id: String,
    pub direction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    pub header_counter: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageKeyRecord {
    pub mk_b64: String,
    pub context: WrapContext,
}

/// Parameters identifying one vault slot plus the metadata wrapped with it.
#[derive(Debug, Clone)]
pub struct VaultEntryParams {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_device_id: String,
    pub target_device_id: String,
    pub direction: Direction,
    pub msg_type: Option<String>,
    pub header_counter: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    Duplicate,
}

/// Highest vaulted transport counter per direction; zero when none.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestCounters {
    pub incoming: u64,
    pub outgoing: u64,
}

#[derive(Clone)]
struct CachedEntry {
    mk_b64: String,
    dr_state_json: Option<String>,
}

// ── Vault ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MessageKeyVault {
    transport: Arc<dyn VaultTransport>,
    cache: Arc<Mutex<LruCache<PeerKey, CachedEntry>>>,
}

impl MessageKeyVault {
    pub fn new(transport: Arc<dyn VaultTransport>) -> Self {
        Self {
            transport,
            cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(KEY_CACHE_CAPACITY).expect("capacity is non-zero"),
            ))),
        }
    }

    /// Deterministic digest of the key bytes bound to the slot. Lets the
    /// server distinguish an idempotent re-put from a conflicting one
    /// without ever reading key material (the wrapped blob itself is salted
    /// and never compares equal).
    fn wrap_digest(params: &VaultEntryParams, mk: &[u8; 32]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"vault-wrap/v1\x00");
        hasher.update(params.conversation_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(params.message_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(params.sender_device_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(mk);
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Wrap and store one message key (plus an optional DR snapshot) under
    /// the Master Key. Idempotent per the vault contract.
    pub async fn put(
        &self,
        account_token: &str,
        account_digest: &str,
        params: &VaultEntryParams,
        mk: &[u8; 32],
        dr_state: Option<&DrState>,
        master_key: &[u8; 32],
    ) -> Result<PutOutcome, StoreError> {
        use base64::{engine::general_purpose::STANDARD as B64, Engine};

        let record = MessageKeyRecord {
            mk_b64: B64.encode(mk),
            context: WrapContext {
                version: 1,
                conversation_id: params.conversation_id.clone(),
                message_id: params.message_id.clone(),
                sender_device_id: params.sender_device_id.clone(),
                target_device_id: params.target_device_id.clone(),
                direction: params.direction.as_str().to_string(),
                msg_type: params.msg_type.clone(),
                header_counter: params.header_counter,
                created_at: Utc::now(),
            },
        };
        let wrapped_mk = envelope::wrap_json(&record, master_key, INFO_MESSAGE_KEY)?;
        let dr_state = dr_state
            .map(|s| envelope::wrap_json(s, master_key, INFO_DR_STATE))
            .transpose()?;

        let response = self
            .transport
            .put(VaultPutRequest {
                account_token: account_token.to_string(),
                account_digest: account_digest.to_string(),
                conversation_id: params.conversation_id.clone(),
                message_id: params.message_id.clone(),
                sender_device_id: params.sender_device_id.clone(),
                wrapped_mk,
                wrap_digest: Self::wrap_digest(params, mk),
                direction: params.direction.as_str().to_string(),
                header_counter: params.header_counter,
                dr_state,
            })
            .await?;

        if response.conflict {
            return Err(StoreError::VaultConflict {
                message_id: params.message_id.clone(),
            });
        }
        Ok(if response.duplicate {
            PutOutcome::Duplicate
        } else {
            PutOutcome::Stored
        })
    }

    /// Fetch and unwrap one entry. When the caller already holds a
    /// server-provided wrapped key (bulk replay with `includeKeys`), it is
    /// preferred and the round-trip is skipped.
    pub async fn get(
        &self,
        req: &VaultGetRequest,
        in_batch_key: Option<&SealedEnvelope>,
        master_key: &[u8; 32],
    ) -> Result<Option<MessageKeyRecord>, StoreError> {
        let (wrapped, dr_state) = match in_batch_key {
            Some(env) => (Some(env.clone()), None),
            None => {
                let resp = self.transport.get(req.clone()).await?;
                (resp.wrapped_mk, resp.dr_state)
            }
        };
        let Some(wrapped) = wrapped else {
            return Ok(None);
        };

        let record: MessageKeyRecord =
            envelope::unwrap_json(&wrapped, master_key, &[INFO_MESSAGE_KEY])?;

        if record.context.conversation_id != req.conversation_id
            || record.context.message_id != req.message_id
            || record.context.sender_device_id != req.sender_device_id
        {
            return Err(StoreError::VaultContextMismatch);
        }

        let _ = dr_state; // DR snapshots ride along; hydration happens on restore
        Ok(Some(record))
    }

    /// Remove an entry — self-healing after an unrecoverable unwrap failure.
    pub async fn delete(&self, req: &VaultGetRequest) -> Result<(), StoreError> {
        self.transport.delete(req.clone()).await
    }

    /// Authoritative local-processed counters for one `(conversation,
    /// senderDevice)` incoming chain (and our own outgoing one).
    pub async fn latest_counters(
        &self,
        conversation_id: &str,
        sender_device_id: &str,
    ) -> Result<LatestCounters, StoreError> {
        let resp = self
            .transport
            .latest_state(conversation_id, sender_device_id)
            .await?;
        Ok(LatestCounters {
            incoming: resp.incoming.map(|s| s.header_counter).unwrap_or(0),
            outgoing: resp.outgoing.map(|s| s.header_counter).unwrap_or(0),
        })
    }

    // ── Per-peer hot cache ───────────────────────────────────────────────

    pub async fn cache_store(&self, peer: &PeerKey, mk_b64: String, dr_state_json: Option<String>) {
        let mut cache = self.cache.lock().await;
        cache.put(peer.clone(), CachedEntry { mk_b64, dr_state_json });
    }

    pub async fn cache_get(&self, peer: &PeerKey) -> Option<(String, Option<String>)> {
        let mut cache = self.cache.lock().await;
        cache
            .get(peer)
            .map(|e| (e.mk_b64.clone(), e.dr_state_json.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory vault server honouring the duplicate/conflict contract.
    #[derive(Default)]
    pub struct FakeVaultServer {
        entries: Mutex<HashMap<(String, String, String), (String, VaultPutRequest)>>,
    }

    #[async_trait]
    impl VaultTransport for FakeVaultServer {
        async fn put(&self, req: VaultPutRequest) -> Result<VaultPutResponse, StoreError> {
            let key = (
                req.conversation_id.clone(),
                req.message_id.clone(),
                req.sender_device_id.clone(),
            );
            let mut entries = self.entries.lock().await;
            if let Some((digest, _)) = entries.get(&key) {
                let conflict = digest != &req.wrap_digest;
                return Ok(VaultPutResponse {
                    duplicate: !conflict,
                    conflict,
                });
            }
            entries.insert(key, (req.wrap_digest.clone(), req));
            Ok(VaultPutResponse {
                duplicate: false,
                conflict: false,
            })
        }

        async fn get(&self, req: VaultGetRequest) -> Result<VaultGetResponse, StoreError> {
            let entries = self.entries.lock().await;
            let key = (
                req.conversation_id.clone(),
                req.message_id.clone(),
                req.sender_device_id.clone(),
            );
            Ok(match entries.get(&key) {
                Some((_, stored)) => VaultGetResponse {
                    wrapped_mk: Some(stored.wrapped_mk.clone()),
                    dr_state: stored.dr_state.clone(),
                },
                None => VaultGetResponse {
                    wrapped_mk: None,
                    dr_state: None,
                },
            })
        }

        async fn delete(&self, req: VaultGetRequest) -> Result<(), StoreError> {
            let mut entries = self.entries.lock().await;
            entries.remove(&(
                req.conversation_id,
                req.message_id,
                req.sender_device_id,
            ));
            Ok(())
        }

        async fn latest_state(
            &self,
            conversation_id: &str,
            sender_device_id: &str,
        ) -> Result<VaultLatestStateResponse, StoreError> {
            let entries = self.entries.lock().await;
            let mut incoming = 0u64;
            let mut outgoing = 0u64;
            for ((conv, _, sender), (_, req)) in entries.iter() {
                if conv != conversation_id || sender != sender_device_id {
                    continue;
                }
                match req.direction.as_str() {
                    "incoming" => incoming = incoming.max(req.header_counter),
                    _ => outgoing = outgoing.max(req.header_counter),
                }
            }
            Ok(VaultLatestStateResponse {
                incoming: (incoming > 0).then_some(sn_proto::api::VaultDirectionState {
                    header_counter: incoming,
                }),
                outgoing: (outgoing > 0).then_some(sn_proto::api::VaultDirectionState {
                    header_counter: outgoing,
                }),
            })
        }
    }

    const MK: [u8; 32] = [0x33u8; 32];

    fn params(msg: &str, counter: u64) -> VaultEntryParams {
        VaultEntryParams {
            conversation_id: "conv".into(),
            message_id: msg.into(),
            sender_device_id: "peer-dev".into(),
            target_device_id: "my-dev".into(),
            direction: Direction::Incoming,
            msg_type: Some("text".into()),
            header_counter: counter,
        }
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let vault = MessageKeyVault::new(Arc::new(FakeVaultServer::default()));
        let mk = [7u8; 32];
        let outcome = vault
            .put("tok", "DIG", &params("m-1", 5), &mk, None, &MK)
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Stored);

        let record = vault
            .get(
                &VaultGetRequest {
                    conversation_id: "conv".into(),
                    message_id: "m-1".into(),
                    sender_device_id: "peer-dev".into(),
                },
                None,
                &MK,
            )
            .await
            .unwrap()
            .expect("entry exists");
        use base64::{engine::general_purpose::STANDARD as B64, Engine};
        assert_eq!(B64.decode(&record.mk_b64).unwrap(), mk.to_vec());
        assert_eq!(record.context.header_counter, 5);
    }

    #[tokio::test]
    async fn idempotent_reput_reports_duplicate() {
        let vault = MessageKeyVault::new(Arc::new(FakeVaultServer::default()));
        let mk = [7u8; 32];
        vault
            .put("tok", "DIG", &params("m-1", 5), &mk, None, &MK)
            .await
            .unwrap();
        let second = vault
            .put("tok", "DIG", &params("m-1", 5), &mk, None, &MK)
            .await
            .unwrap();
        assert_eq!(second, PutOutcome::Duplicate);
    }

    #[tokio::test]
    async fn conflicting_reput_is_rejected() {
        let vault = MessageKeyVault::new(Arc::new(FakeVaultServer::default()));
        vault
            .put("tok", "DIG", &params("m-1", 5), &[7u8; 32], None, &MK)
            .await
            .unwrap();
        let err = vault
            .put("tok", "DIG", &params("m-1", 5), &[8u8; 32], None, &MK)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VaultConflict { .. }));
    }

    #[tokio::test]
    async fn in_batch_key_skips_transport() {
        let vault = MessageKeyVault::new(Arc::new(FakeVaultServer::default()));
        // Seal a record out-of-band, as the list endpoint would return it.
        let record = MessageKeyRecord {
            mk_b64: "a2V5".into(),
            context: WrapContext {
                version: 1,
                conversation_id: "conv".into(),
                message_id: "m-9".into(),
                sender_device_id: "peer-dev".into(),
                target_device_id: "my-dev".into(),
                direction: "incoming".into(),
                msg_type: None,
                header_counter: 9,
                created_at: Utc::now(),
            },
        };
        let env = envelope::wrap_json(&record, &MK, INFO_MESSAGE_KEY).unwrap();

        let got = vault
            .get(
                &VaultGetRequest {
                    conversation_id: "conv".into(),
                    message_id: "m-9".into(),
                    sender_device_id: "peer-dev".into(),
                },
                Some(&env),
                &MK,
            )
            .await
            .unwrap()
            .expect("in-batch entry");
        assert_eq!(got.context.header_counter, 9);
    }

    #[tokio::test]
    async fn context_mismatch_is_detected() {
        let vault = MessageKeyVault::new(Arc::new(FakeVaultServer::default()));
        vault
            .put("tok", "DIG", &params("m-1", 5), &[7u8; 32], None, &MK)
            .await
            .unwrap();
        // Ask for the stored blob under a different message id by stuffing it
        // in as an in-batch key.
        let resp = vault
            .transport
            .get(VaultGetRequest {
                conversation_id: "conv".into(),
                message_id: "m-1".into(),
                sender_device_id: "peer-dev".into(),
            })
            .await
            .unwrap();
        let err = vault
            .get(
                &VaultGetRequest {
                    conversation_id: "conv".into(),
                    message_id: "m-2".into(),
                    sender_device_id: "peer-dev".into(),
                },
                resp.wrapped_mk.as_ref(),
                &MK,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VaultContextMismatch));
    }

    #[tokio::test]
    async fn latest_counters_track_max_per_direction() {
        let vault = MessageKeyVault::new(Arc::new(FakeVaultServer::default()));
        for (msg, counter) in [("m-1", 3u64), ("m-2", 7), ("m-3", 5)] {
            vault
                .put("tok", "DIG", &params(msg, counter), &[counter as u8; 32], None, &MK)
                .await
                .unwrap();
        }
        let latest = vault.latest_counters("conv", "peer-dev").await.unwrap();
        assert_eq!(latest.incoming, 7);
        assert_eq!(latest.outgoing, 0);
    }
}
