//! Live coordinator — Route B.
//!
//! Single-writer discipline: all DR mutation for a peer happens under that
//! peer's lock, one packet at a time. The commit protocol per packet:
//!
//!   1. readiness (contact secret present, else `SECURE_PENDING`),
//!   2. DR state present (hydrate/bootstrap, else `DR_STATE_UNAVAILABLE`),
//!   3. work on a deep copy of the stored state,
//!   4. ratchet-decrypt (any crypto failure leaves the store untouched),
//!   5. vault-put the message key — durability gate,
//!   6. only then commit the advanced state back to the store.
//!
//! A failed vault put leaves the stored counters where they were and
//! enqueues a pending re-put; the next pass re-derives the key via the
//! skipped-key table and hits `duplicate:true`.
//!
//! Per-peer phases run Idle → Locked → Decrypting → {Committed|Rolledback}
//! → Idle. Recoverable errors retry with 1s/2s/4s backoff, capped; crypto
//! failures never retry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use sn_crypto::identity::{b64_decode_32, PeerKey};
use sn_crypto::ratchet::{DrState, Role, SessionBaseKey};
use sn_crypto::x3dh;
use sn_proto::api::{BundleRequest, SendSecureRequest, MaxCounterQuery};
use sn_proto::packet::{Direction, PacketKind, ReplayItem};
use sn_store::contacts::ContactSecret;
use sn_store::vault::{PutOutcome, VaultEntryParams};

use crate::{
    error::{EngineError, ErrorKind},
    events::{DecryptedMessage, EngineEvent},
    session::Session,
};

pub const PENDING_PUT_CAPACITY: usize = 500;

// ── Phases ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Idle,
    Locked,
    Decrypting,
    Committed,
    Rolledback,
}

// ── Pending puts ─────────────────────────────────────────────────────────────

struct PendingPut {
    params: VaultEntryParams,
    mk: [u8; 32],
}

// ── Coordinator ──────────────────────────────────────────────────────────────

pub struct LiveCoordinator {
    session: Arc<Session>,
    locks: Mutex<HashMap<PeerKey, Arc<Mutex<()>>>>,
    phases: Mutex<HashMap<PeerKey, PeerPhase>>,
    pending_puts: Mutex<VecDeque<PendingPut>>,
}

impl LiveCoordinator {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            locks: Mutex::new(HashMap::new()),
            phases: Mutex::new(HashMap::new()),
            pending_puts: Mutex::new(VecDeque::new()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    async fn peer_lock(&self, peer: &PeerKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(peer.clone()).or_default().clone()
    }

    async fn set_phase(&self, peer: &PeerKey, phase: PeerPhase) {
        self.phases.lock().await.insert(peer.clone(), phase);
    }

    pub async fn phase(&self, peer: &PeerKey) -> PeerPhase {
        self.phases
            .lock()
            .await
            .get(peer)
            .copied()
            .unwrap_or(PeerPhase::Idle)
    }

    pub async fn pending_put_len(&self) -> usize {
        self.pending_puts.lock().await.len()
    }

    // ── Peer resolution ──────────────────────────────────────────────────

    async fn resolve_peer(&self, item: &ReplayItem) -> Result<PeerKey, EngineError> {
        if let Some(peer) = item.peer_key() {
            return Ok(peer);
        }
        self.session
            .contact_for_conversation(&item.conversation_id, &item.sender_device_id)
            .await
            .map(|s| s.peer_key())
            .ok_or_else(|| {
                EngineError::new(
                    ErrorKind::SecurePending,
                    "cannot resolve packet sender to a known endpoint",
                )
                .with_counter(item.counter)
            })
    }

    // ── Responder bootstrap ──────────────────────────────────────────────

    /// Build the responder-side DR state out of the `dr_init` blob carried
    /// by the contact secret.
    async fn bootstrap_responder(
        &self,
        peer: &PeerKey,
        secret: &ContactSecret,
    ) -> Result<DrState, EngineError> {
        let Some(ref dr_init) = secret.dr_init else {
            return Err(EngineError::new(
                ErrorKind::DrStateUnavailable,
                "no DR state and no dr_init to bootstrap from",
            )
            .with_peer(peer));
        };

        let device_keys = self
            .session
            .keyring
            .device_keys()
            .await
            .ok_or_else(|| EngineError::identity_missing("device key bundle"))?;

        // Initiator identity key comes from the directory, keyed by digest.
        let bundle = self
            .session
            .api
            .fetch_bundle(BundleRequest {
                account_token: self.session.keyring.account_token().await?,
                account_digest: self.session.keyring.account_digest().await?.to_string(),
                peer_account_digest: peer.digest().to_string(),
                peer_device_id: Some(peer.device_id().to_string()),
            })
            .await?;
        let initiator_ik = b64_decode_32(&bundle.bundle.ik_pub).map_err(EngineError::from)?;

        let opk_secret = match dr_init.used_opk_id {
            Some(id) => self
                .session
                .keyring
                .with_device_keys_mut(|b| b.take_opk(id))
                .await?
                .map(|opk| opk.secret()),
            None => None,
        };

        let sk = x3dh::respond(
            &device_keys.identity(),
            &device_keys.spk_secret(),
            opk_secret.as_ref(),
            &initiator_ik,
            dr_init,
        )
        .map_err(|e| EngineError::from(e).with_peer(peer))?;

        let state = DrState::new_responder(
            sk,
            device_keys.spk_secret(),
            SessionBaseKey {
                conversation_id: secret.conversation_id.clone(),
                peer_account_digest: peer.digest().clone(),
                peer_device_id: peer.device_id().to_string(),
                role: Role::Responder,
                conversation_token_b64: secret.token_b64.clone(),
            },
        );
        self.session.sessions.commit(peer, state.clone()).await;
        tracing::info!(
            target: "sn_engine",
            event = "dr_bootstrap_responder",
            peer = %peer,
            conversation = %secret.conversation_id
        );
        Ok(state)
    }

    /// Hydrate or bootstrap the DR state for one endpoint under its lock.
    /// Used by the restore pipeline (stage 3).
    pub async fn ensure_session(&self, peer: &PeerKey) -> Result<(), EngineError> {
        let lock = self.peer_lock(peer).await;
        let _guard = lock.lock().await;
        if self.session.sessions.contains(peer).await {
            return Ok(());
        }
        let secret = self.session.require_secure_ready(peer).await?;
        self.bootstrap_responder(peer, &secret)
            .await
            .map(|_| ())
            .map_err(|e| e.with_peer(peer))
    }

    // ── Route B: one incoming packet ─────────────────────────────────────

    /// Decrypt one packet under the peer lock, with the vault-before-commit
    /// discipline. Errors are wrapped with peer and counter context.
    pub async fn process(&self, item: &ReplayItem) -> Result<DecryptedMessage, EngineError> {
        let peer = self.resolve_peer(item).await?;
        let lock = self.peer_lock(&peer).await;
        let _guard = lock.lock().await;
        self.set_phase(&peer, PeerPhase::Locked).await;

        let result = self.process_locked(&peer, item).await;
        match &result {
            Ok(msg) => {
                self.set_phase(&peer, PeerPhase::Committed).await;
                self.session
                    .events
                    .emit(EngineEvent::MessageDecrypted(msg.clone()));
            }
            Err(_) => self.set_phase(&peer, PeerPhase::Rolledback).await,
        }
        self.set_phase(&peer, PeerPhase::Idle).await;
        result.map_err(|e| e.with_peer(&peer).with_counter(item.counter))
    }

    async fn process_locked(
        &self,
        peer: &PeerKey,
        item: &ReplayItem,
    ) -> Result<DecryptedMessage, EngineError> {
        // Our own messages never ratchet backwards — their keys were vaulted
        // at send time, so they replay statelessly or not at all.
        if item.direction == Direction::Outgoing {
            return self.replay_outgoing(peer, item).await;
        }

        let secret = self.session.require_secure_ready(peer).await?;

        // Deep copy; the store keeps the rollback point until we commit.
        let mut state = match self.session.sessions.get(peer).await {
            Some(s) => s,
            None => self.bootstrap_responder(peer, &secret).await?,
        };

        self.set_phase(peer, PeerPhase::Decrypting).await;
        let (plaintext, mk) = state
            .decrypt(&item.header, &item.ciphertext_b64)
            .map_err(EngineError::from)?;

        let my_device = self.session.keyring.device_id().await?;
        let params = VaultEntryParams {
            conversation_id: item.conversation_id.clone(),
            message_id: item.message_id.clone(),
            sender_device_id: item.sender_device_id.clone(),
            target_device_id: my_device,
            direction: item.direction,
            msg_type: item.msg_type.clone(),
            header_counter: item.counter,
        };

        let master_key = self.session.keyring.mk().await?;
        let token = self.session.keyring.account_token().await?;
        let digest = self.session.keyring.account_digest().await?;
        let put = self
            .session
            .vault
            .put(&token, digest.as_str(), &params, &mk, Some(&state), &master_key)
            .await;

        match put {
            Ok(PutOutcome::Stored) | Ok(PutOutcome::Duplicate) => {}
            Err(e) => {
                let engine_err = EngineError::from(e);
                if engine_err.kind == ErrorKind::IntegrityFailure {
                    // Conflicting slot — not a storage transient.
                    return Err(engine_err);
                }
                self.enqueue_pending_put(params, mk).await;
                tracing::warn!(
                    target: "sn_engine",
                    event = "vault_put_failed",
                    peer = %peer,
                    counter = item.counter,
                    error = %engine_err
                );
                return Err(EngineError::new(
                    ErrorKind::VaultPutFailed,
                    engine_err.message,
                ));
            }
        }

        // Durable — commit the advanced counters and refresh the hot cache.
        self.session.sessions.commit(peer, state.clone()).await;
        {
            use base64::{engine::general_purpose::STANDARD as B64, Engine};
            let snapshot_json = serde_json::to_string(&state).ok();
            self.session
                .vault
                .cache_store(peer, B64.encode(mk), snapshot_json)
                .await;
        }

        tracing::info!(
            target: "sn_engine",
            event = "live_commit",
            peer = %peer,
            counter = item.counter,
            message_id = %item.message_id
        );

        Ok(DecryptedMessage {
            message_id: item.message_id.clone(),
            conversation_id: item.conversation_id.clone(),
            peer: peer.clone(),
            counter: item.counter,
            direction: item.direction,
            kind: item.kind,
            msg_type: item.msg_type.clone(),
            plaintext: plaintext.to_vec(),
            created_at: item.created_at,
        })
    }

    /// Stateless replay of one of our own sent messages via its vaulted key.
    async fn replay_outgoing(
        &self,
        peer: &PeerKey,
        item: &ReplayItem,
    ) -> Result<DecryptedMessage, EngineError> {
        let master_key = self.session.keyring.mk().await?;
        let record = self
            .session
            .vault
            .get(
                &sn_proto::api::VaultGetRequest {
                    conversation_id: item.conversation_id.clone(),
                    message_id: item.message_id.clone(),
                    sender_device_id: item.sender_device_id.clone(),
                },
                item.server_key.as_ref(),
                &master_key,
            )
            .await?
            .ok_or_else(|| {
                EngineError::new(
                    ErrorKind::SkippedMissing,
                    "own message has no vaulted key on this account",
                )
            })?;
        let mk = b64_decode_32(&record.mk_b64).map_err(EngineError::from)?;
        let plaintext = crate::replay::decrypt_item_with_mk(item, &mk)?;

        Ok(DecryptedMessage {
            message_id: item.message_id.clone(),
            conversation_id: item.conversation_id.clone(),
            peer: peer.clone(),
            counter: item.counter,
            direction: item.direction,
            kind: item.kind,
            msg_type: item.msg_type.clone(),
            plaintext,
            created_at: item.created_at,
        })
    }

    /// `process` plus the retry policy for recoverable codes. Crypto
    /// failures surface immediately.
    pub async fn process_with_retry(
        &self,
        item: &ReplayItem,
    ) -> Result<DecryptedMessage, EngineError> {
        let max = self.session.config.live_retry_max;
        let mut attempt = 0;
        loop {
            match self.process(item).await {
                Ok(msg) => return Ok(msg),
                Err(e) if e.kind.is_recoverable() && attempt < max => {
                    let delay = self.session.config.backoff_for_attempt(attempt);
                    tracing::debug!(
                        target: "sn_engine",
                        event = "live_retry",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        code = %e.kind
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Pending puts ─────────────────────────────────────────────────────

    async fn enqueue_pending_put(&self, params: VaultEntryParams, mk: [u8; 32]) {
        let mut queue = self.pending_puts.lock().await;
        if queue.len() >= PENDING_PUT_CAPACITY {
            let dropped = queue.pop_front();
            if let Some(d) = dropped {
                tracing::warn!(
                    target: "sn_engine",
                    event = "pending_put_dropped",
                    message_id = %d.params.message_id,
                    reason = "capacity"
                );
            }
        }
        queue.push_back(PendingPut { params, mk });
    }

    /// Retry queued vault writes. Successes drain; failures requeue at the
    /// back. Returns how many entries were flushed.
    pub async fn flush_pending_puts(&self) -> usize {
        let drained: Vec<PendingPut> = {
            let mut queue = self.pending_puts.lock().await;
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return 0;
        }

        let Ok(master_key) = self.session.keyring.mk().await else {
            let mut queue = self.pending_puts.lock().await;
            queue.extend(drained);
            return 0;
        };
        let Ok(token) = self.session.keyring.account_token().await else {
            let mut queue = self.pending_puts.lock().await;
            queue.extend(drained);
            return 0;
        };
        let Ok(digest) = self.session.keyring.account_digest().await else {
            let mut queue = self.pending_puts.lock().await;
            queue.extend(drained);
            return 0;
        };

        let mut flushed = 0;
        for entry in drained {
            let ok = self
                .session
                .vault
                .put(
                    &token,
                    digest.as_str(),
                    &entry.params,
                    &entry.mk,
                    None,
                    &master_key,
                )
                .await
                .is_ok();
            if ok {
                flushed += 1;
            } else {
                self.enqueue_pending_put(entry.params, entry.mk).await;
            }
        }
        flushed
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Encrypt and send one user message under the peer lock. Handles the
    /// `COUNTER_TOO_LOW` reseed (transport counter only — the DR chain is
    /// not advanced a second time).
    pub async fn send_user_message(
        &self,
        peer: &PeerKey,
        plaintext: &[u8],
        msg_type: Option<String>,
    ) -> Result<DecryptedMessage, EngineError> {
        let lock = self.peer_lock(peer).await;
        let _guard = lock.lock().await;

        let _secret = self.session.require_secure_ready(peer).await?;
        let mut state = self.session.sessions.get(peer).await.ok_or_else(|| {
            EngineError::new(ErrorKind::SecurePending, "no DR state for peer yet").with_peer(peer)
        })?;

        let my_device = self.session.keyring.device_id().await?;
        let (mut header, mut ciphertext_b64, mk) = state
            .encrypt(plaintext, &my_device)
            .map_err(|e| EngineError::from(e).with_peer(peer))?;

        let message_id = uuid::Uuid::new_v4().to_string();
        let conversation_id = state.base.conversation_id.clone();
        let token = self.session.keyring.account_token().await?;
        let digest = self.session.keyring.account_digest().await?;

        let mut request = SendSecureRequest {
            account_token: token.clone(),
            account_digest: digest.to_string(),
            conversation_id: conversation_id.clone(),
            id: message_id.clone(),
            header: serde_json::json!({ "dr": header }),
            ciphertext_b64: ciphertext_b64.clone(),
            counter: header.counter,
            sender_device_id: my_device.clone(),
            receiver_digest: peer.digest().to_string(),
            receiver_device_id: peer.device_id().to_string(),
            msg_type: msg_type.clone(),
            created_at: chrono::Utc::now(),
        };

        let mut response = self.session.api.send_secure(request.clone()).await;
        if matches!(&response, Err(e) if e.kind == ErrorKind::CounterTooLow) {
            // Reseed from the server's view and retry exactly once. Same
            // chain key, fresh IV, counter rebound into the AAD.
            let max = self
                .session
                .api
                .max_counter(MaxCounterQuery {
                    conversation_id: conversation_id.clone(),
                    sender_device_id: my_device.clone(),
                })
                .await?;
            let reseeded = max.max_counter + 1;
            tracing::warn!(
                target: "sn_engine",
                event = "counter_reseed",
                peer = %peer,
                stale = header.counter,
                reseeded
            );
            state.ns_total = reseeded;
            header.counter = reseeded;

            use base64::{engine::general_purpose::STANDARD as B64, Engine};
            use rand::RngCore;
            let mut iv = [0u8; sn_crypto::envelope::IV_LEN];
            rand::rngs::OsRng.fill_bytes(&mut iv);
            header.iv_b64 = B64.encode(iv);
            let resealed =
                sn_crypto::envelope::seal(&mk, &iv, header.aad().as_bytes(), plaintext)
                    .map_err(EngineError::from)?;
            ciphertext_b64 = B64.encode(&resealed);

            request.header = serde_json::json!({ "dr": header });
            request.ciphertext_b64 = ciphertext_b64.clone();
            request.counter = header.counter;
            response = self.session.api.send_secure(request).await;
        }
        response.map_err(|e| e.with_peer(peer))?;

        // Commit the advanced sending chain, then vault our own message key
        // so sibling devices can replay this message. A failed put goes the
        // pending-put route like any other.
        self.session.sessions.commit(peer, state.clone()).await;
        if let Some(cache) = &self.session.cache {
            let _ = cache.set_device_counter(&my_device, state.ns_total).await;
        }

        let params = VaultEntryParams {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            sender_device_id: my_device.clone(),
            target_device_id: peer.device_id().to_string(),
            direction: Direction::Outgoing,
            msg_type: msg_type.clone(),
            header_counter: header.counter,
        };
        let master_key = self.session.keyring.mk().await?;
        if self
            .session
            .vault
            .put(&token, digest.as_str(), &params, &mk, Some(&state), &master_key)
            .await
            .is_err()
        {
            self.enqueue_pending_put(params, mk).await;
        }

        tracing::info!(
            target: "sn_engine",
            event = "send_commit",
            peer = %peer,
            counter = header.counter,
            message_id = %message_id
        );

        Ok(DecryptedMessage {
            message_id,
            conversation_id,
            peer: peer.clone(),
            counter: header.counter,
            direction: Direction::Outgoing,
            kind: PacketKind::UserMessage,
            msg_type,
            plaintext: plaintext.to_vec(),
            created_at: chrono::Utc::now(),
        })
    }
}
