//! Replay / hybrid fetcher — Route A.
//!
//! Bulk history path. One page of packets is fetched with
//! `includeKeys=true`; every packet whose wrapped key came back in-batch is
//! decrypted statelessly (unwrap with MK, open with the message key) — no DR
//! state touched, parallel-safe. Packets without a vaulted key fall back to
//! Route B through the live coordinator, strictly sequential per peer and
//! sorted by counter.
//!
//! Within one peer group the Route-A-capable items run first as a priority
//! batch; Route-A failures rejoin the Route-B tail of the same group so
//! ordering per peer is preserved.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use tokio::task::JoinSet;

use sn_crypto::envelope;
use sn_crypto::identity::b64_decode_32;
use sn_proto::api::{ListSecureQuery, VaultGetRequest};
use sn_proto::packet::{self, ReplayItem};

use crate::{
    coordinator::LiveCoordinator,
    error::{EngineError, ErrorKind},
    events::{DecryptedMessage, ErrorRecord},
    fetch_lock::FetchOwner,
    session::Session,
};

/// Open one item's ciphertext with an already-recovered message key.
/// Stateless: header AAD + IV, nothing ratchets.
pub fn decrypt_item_with_mk(item: &ReplayItem, mk: &[u8; 32]) -> Result<Vec<u8>, EngineError> {
    let iv_raw = B64
        .decode(&item.header.iv_b64)
        .map_err(|e| EngineError::new(ErrorKind::Internal, e.to_string()))?;
    let iv: [u8; envelope::IV_LEN] = iv_raw
        .as_slice()
        .try_into()
        .map_err(|_| EngineError::new(ErrorKind::Internal, "dr header iv must be 12 bytes"))?;
    let ct = B64
        .decode(&item.ciphertext_b64)
        .map_err(|e| EngineError::new(ErrorKind::Internal, e.to_string()))?;
    let pt = envelope::open(mk, &iv, item.header.aad().as_bytes(), &ct)
        .map_err(EngineError::from)?;
    Ok(pt.to_vec())
}

/// Outcome of one replay page.
#[derive(Default)]
pub struct ReplayOutcome {
    pub decrypted: Vec<DecryptedMessage>,
    pub errors: Vec<ErrorRecord>,
    pub next_cursor_ts: Option<chrono::DateTime<chrono::Utc>>,
    pub next_cursor_id: Option<String>,
}

pub struct ReplayFetcher {
    session: Arc<Session>,
    coordinator: Arc<LiveCoordinator>,
}

impl ReplayFetcher {
    pub fn new(session: Arc<Session>, coordinator: Arc<LiveCoordinator>) -> Self {
        Self {
            session,
            coordinator,
        }
    }

    /// Fetch and decrypt one page of history for a conversation.
    ///
    /// Holds the conversation's secure-fetch lock as `replay` for the whole
    /// page; a live fetcher wanting the conversation raises our
    /// cancellation flag and the remaining Route-B tail is abandoned (the
    /// packets stay on the server and re-list later).
    pub async fn fetch_page(
        &self,
        conversation_id: &str,
        limit: u32,
        cursor_ts: Option<chrono::DateTime<chrono::Utc>>,
        cursor_id: Option<String>,
    ) -> Result<ReplayOutcome, EngineError> {
        let fetch_guard = self
            .session
            .fetch_locks
            .acquire(conversation_id, FetchOwner::Replay)
            .await;
        let cancel = fetch_guard.cancel_flag();

        let listing = self
            .session
            .api
            .list_secure(ListSecureQuery {
                conversation_id: conversation_id.to_string(),
                limit,
                cursor_ts,
                cursor_id,
                include_keys: true,
            })
            .await?;

        let me = self.session.self_identity().await?;
        let (items, dropped) = packet::resolve_batch(&listing.packets, &me);

        let mut outcome = ReplayOutcome {
            next_cursor_ts: listing.next_cursor_ts,
            next_cursor_id: listing.next_cursor_id,
            ..Default::default()
        };
        for d in dropped {
            outcome.errors.push(ErrorRecord::new(
                d.message_id,
                d.conversation_id,
                ErrorKind::Internal,
                d.reason,
            ));
        }

        // Group per sender device (ordering is only defined within one
        // sender); BTreeMap keeps deterministic group order.
        let mut groups: BTreeMap<String, Vec<ReplayItem>> = BTreeMap::new();
        for item in items {
            groups.entry(item.sender_device_id.clone()).or_default().push(item);
        }

        // Groups run in parallel; items within a group strictly in counter
        // order.
        let mut join_set = JoinSet::new();
        for (_, group) in groups {
            let session = Arc::clone(&self.session);
            let coordinator = Arc::clone(&self.coordinator);
            let cancel = Arc::clone(&cancel);
            join_set.spawn(async move { process_group(session, coordinator, group, cancel).await });
        }
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((mut decrypted, mut errors)) => {
                    outcome.decrypted.append(&mut decrypted);
                    outcome.errors.append(&mut errors);
                }
                Err(e) => {
                    tracing::error!(target: "sn_engine", event = "replay_group_panic", error = %e);
                }
            }
        }

        // Cross-group presentation order.
        outcome
            .decrypted
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.counter.cmp(&b.counter)));
        Ok(outcome)
    }
}

/// One sender-device group: priority Route-A batch, then Route B in counter
/// order (Route-A failures rejoin here).
async fn process_group(
    session: Arc<Session>,
    coordinator: Arc<LiveCoordinator>,
    mut group: Vec<ReplayItem>,
    cancel: Arc<AtomicBool>,
) -> (Vec<DecryptedMessage>, Vec<ErrorRecord>) {
    group.sort_by_key(|i| i.counter);

    let mut decrypted = Vec::new();
    let mut errors = Vec::new();
    let mut route_b: Vec<ReplayItem> = Vec::new();

    let master_key = match session.keyring.mk().await {
        Ok(mk) => mk,
        Err(e) => {
            let err = EngineError::from(e);
            for item in group {
                errors.push(record_for(&item, &err));
            }
            return (decrypted, errors);
        }
    };

    for item in group {
        if item.server_key.is_none() {
            route_b.push(item);
            continue;
        }
        match route_a_decrypt(&session, &item, &master_key).await {
            Ok(msg) => decrypted.push(msg),
            Err(err) => {
                tracing::debug!(
                    target: "sn_engine",
                    event = "route_a_fallback",
                    message_id = %item.message_id,
                    counter = item.counter,
                    code = %err.kind
                );
                route_b.push(item);
            }
        }
    }

    route_b.sort_by_key(|i| i.counter);
    for item in route_b {
        // A live fetcher preempted us; release the conversation promptly.
        // The remaining packets stay server-side and re-list later.
        if cancel.load(Ordering::SeqCst) {
            tracing::debug!(
                target: "sn_engine",
                event = "replay_preempted",
                remaining_from = item.counter
            );
            break;
        }
        match coordinator.process_with_retry(&item).await {
            Ok(msg) => decrypted.push(msg),
            Err(err) => errors.push(record_for(&item, &err)),
        }
    }

    (decrypted, errors)
}

async fn route_a_decrypt(
    session: &Arc<Session>,
    item: &ReplayItem,
    master_key: &[u8; 32],
) -> Result<DecryptedMessage, EngineError> {
    let request = VaultGetRequest {
        conversation_id: item.conversation_id.clone(),
        message_id: item.message_id.clone(),
        sender_device_id: item.sender_device_id.clone(),
    };
    let record = match session
        .vault
        .get(&request, item.server_key.as_ref(), master_key)
        .await
    {
        Ok(record) => record,
        Err(e) => {
            let err = EngineError::from(e);
            if err.kind == ErrorKind::IntegrityFailure {
                // Self-healing: an entry that no longer unwraps is useless
                // to every device — drop it so Route B rebuilds it.
                tracing::warn!(
                    target: "sn_engine",
                    event = "vault_entry_self_heal",
                    message_id = %item.message_id
                );
                let _ = session.vault.delete(&request).await;
            }
            return Err(err);
        }
    }
    .ok_or_else(|| EngineError::new(ErrorKind::SkippedMissing, "no vaulted key"))?;

    let mk = b64_decode_32(&record.mk_b64).map_err(EngineError::from)?;
    let plaintext = decrypt_item_with_mk(item, &mk)?;

    let peer = match item.peer_key() {
        Some(p) => p,
        None => session
            .contact_for_conversation(&item.conversation_id, &item.sender_device_id)
            .await
            .map(|s| s.peer_key())
            .ok_or_else(|| {
                EngineError::new(ErrorKind::SecurePending, "unknown endpoint for replay item")
            })?,
    };

    Ok(DecryptedMessage {
        message_id: item.message_id.clone(),
        conversation_id: item.conversation_id.clone(),
        peer,
        counter: item.counter,
        direction: item.direction,
        kind: item.kind,
        msg_type: item.msg_type.clone(),
        plaintext,
        created_at: item.created_at,
    })
}

fn record_for(item: &ReplayItem, err: &EngineError) -> ErrorRecord {
    let mut record = ErrorRecord::new(
        item.message_id.clone(),
        item.conversation_id.clone(),
        err.kind,
        err.to_string(),
    );
    record.peer = item.peer_key().map(|p| p.to_string());
    record.counter = Some(item.counter);
    record
}
