//! Contact-share flow.
//!
//! Outgoing: opening a conversation performs the X3DH handshake against the
//! peer's published bundle, commits the initiator DR state, and seals a
//! contact-share (carrying the conversation token and the `dr_init` blob)
//! under the one-time invite secret. Later profile updates reuse the
//! conversation token as the sealing key.
//!
//! Incoming rules, in order:
//!   - self-ghost guard: a share whose sender digest equals our own is
//!     skipped with `SELF_DIGEST_SKIP` — no write, no event;
//!   - monotone writer-wins: `profileUpdatedAt` must be strictly newer than
//!     the stored entry, equal timestamps skip;
//!   - on apply: upsert the secret, drop pending invites for that endpoint,
//!     refresh the local wrapped blob, fire `contacts:changed` and
//!     `contacts:entry-updated`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::Utc;

use sn_crypto::envelope::SealedEnvelope;
use sn_crypto::identity::{b64_decode_32, AccountDigest, PeerKey};
use sn_crypto::ratchet::{DrState, Role, SessionBaseKey};
use sn_crypto::x3dh;
use sn_proto::api::BundleRequest;
use sn_proto::contact::{
    self, ContactConversation, ContactSharePayload, CONTACT_SHARE_KIND,
};
use sn_store::contacts::{ContactSecret, UpsertOutcome};

use crate::{
    error::{EngineError, ErrorKind},
    events::EngineEvent,
    session::Session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    Applied,
    /// Sender digest equals our own digest.
    SelfDigestSkip,
    /// Stored profile is as new or newer.
    SkippedStale,
}

/// Result of opening a conversation towards a peer.
pub struct OutgoingShare {
    pub secret: ContactSecret,
    /// Contact-share sealed under the invite secret; ship it through the
    /// invite side-channel.
    pub sealed: SealedEnvelope,
}

// ── Outgoing ─────────────────────────────────────────────────────────────────

/// Open a new conversation as the initiator: X3DH against the peer's
/// bundle, DR state committed, share sealed under `invite_secret`.
pub async fn initiate_conversation(
    session: &Arc<Session>,
    invite_secret: &[u8; 32],
    peer_digest: &AccountDigest,
    nickname: Option<String>,
) -> Result<OutgoingShare, EngineError> {
    let device_keys = session
        .keyring
        .device_keys()
        .await
        .ok_or_else(|| EngineError::identity_missing("device key bundle"))?;

    let bundle = session
        .api
        .fetch_bundle(BundleRequest {
            account_token: session.keyring.account_token().await?,
            account_digest: session.keyring.account_digest().await?.to_string(),
            peer_account_digest: peer_digest.to_string(),
            peer_device_id: None,
        })
        .await?;
    let peer_device_id = bundle.device_id.clone();

    let init = x3dh::initiate(&device_keys.identity(), &bundle.bundle)
        .map_err(EngineError::from)?;

    let spk_pub = x25519_dalek::PublicKey::from(
        b64_decode_32(&bundle.bundle.spk_pub).map_err(EngineError::from)?,
    );

    let conversation_id = uuid::Uuid::new_v4().to_string();
    let mut token = [0u8; 32];
    {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut token);
    }
    let token_b64 = B64.encode(token);

    let peer = PeerKey::new(peer_digest.clone(), peer_device_id.clone());
    let state = DrState::new_initiator(
        init.shared_key,
        init.ek_secret,
        &spk_pub,
        SessionBaseKey {
            conversation_id: conversation_id.clone(),
            peer_account_digest: peer_digest.clone(),
            peer_device_id: peer_device_id.clone(),
            role: Role::Initiator,
            conversation_token_b64: token_b64.clone(),
        },
    )
    .map_err(EngineError::from)?;
    session.sessions.commit(&peer, state).await;

    let now = Utc::now();
    let my_device = session.keyring.device_id().await?;
    let payload = ContactSharePayload {
        kind: CONTACT_SHARE_KIND.into(),
        nickname: nickname.clone(),
        avatar: None,
        conversation: ContactConversation {
            token_b64: token_b64.clone(),
            conversation_id: conversation_id.clone(),
            dr_init: Some(init.dr_init.clone()),
            // From the receiver's point of view, the peer device is ours.
            peer_device_id: my_device,
        },
        added_at: now,
        profile_updated_at: now,
    };
    let sealed = contact::seal_payload(&payload, invite_secret)
        .map_err(|e| EngineError::new(ErrorKind::Internal, e.to_string()))?;

    let secret = ContactSecret {
        conversation_id,
        token_b64,
        peer_account_digest: peer_digest.clone(),
        peer_device_id,
        dr_init: None,
        nickname,
        avatar: None,
        added_at: now,
        profile_updated_at: now,
    };
    session.contacts.upsert(secret.clone()).await;
    session.events.emit(EngineEvent::ContactsChanged);
    persist_contact_blob(session).await;

    Ok(OutgoingShare { secret, sealed })
}

/// Seal a profile-update share for an existing conversation under its
/// conversation token.
pub async fn profile_update_share(
    session: &Arc<Session>,
    peer: &PeerKey,
    nickname: Option<String>,
    avatar: Option<String>,
) -> Result<SealedEnvelope, EngineError> {
    let secret = session.require_secure_ready(peer).await?;
    let token = b64_decode_32(&secret.token_b64).map_err(EngineError::from)?;
    let my_device = session.keyring.device_id().await?;
    let payload = ContactSharePayload {
        kind: CONTACT_SHARE_KIND.into(),
        nickname,
        avatar,
        conversation: ContactConversation {
            token_b64: secret.token_b64.clone(),
            conversation_id: secret.conversation_id.clone(),
            dr_init: None,
            peer_device_id: my_device,
        },
        added_at: secret.added_at,
        profile_updated_at: Utc::now(),
    };
    contact::seal_payload(&payload, &token)
        .map_err(|e| EngineError::new(ErrorKind::Internal, e.to_string()))
}

// ── Incoming ─────────────────────────────────────────────────────────────────

/// Open an incoming sealed share: the invite secret first (session-opening
/// exchange), then every known conversation token.
pub async fn open_incoming_share(
    session: &Arc<Session>,
    env: &SealedEnvelope,
    invite_secret: Option<&[u8; 32]>,
) -> Result<ContactSharePayload, EngineError> {
    if let Some(key) = invite_secret {
        if let Ok(payload) = contact::open_payload(env, key) {
            return Ok(payload);
        }
    }
    for secret in session.contacts.all().await {
        let Ok(token) = b64_decode_32(&secret.token_b64) else {
            continue;
        };
        if let Ok(payload) = contact::open_payload(env, &token) {
            return Ok(payload);
        }
    }
    Err(EngineError::new(
        ErrorKind::IntegrityFailure,
        "contact-share does not open under any known secret",
    ))
}

/// Apply the incoming-share rules. `sender_digest` is the authenticated
/// sender of the side-channel envelope.
pub async fn apply_incoming_share(
    session: &Arc<Session>,
    payload: &ContactSharePayload,
    sender_digest: &AccountDigest,
) -> Result<ShareOutcome, EngineError> {
    let my_digest = session.keyring.account_digest().await?;
    if sender_digest == &my_digest {
        tracing::warn!(
            target: "sn_engine",
            event = "contact_share_self_ghost",
            code = "SELF_DIGEST_SKIP",
            digest = %sender_digest
        );
        return Ok(ShareOutcome::SelfDigestSkip);
    }

    let secret = ContactSecret {
        conversation_id: payload.conversation.conversation_id.clone(),
        token_b64: payload.conversation.token_b64.clone(),
        peer_account_digest: sender_digest.clone(),
        peer_device_id: payload.conversation.peer_device_id.clone(),
        dr_init: payload.conversation.dr_init.clone(),
        nickname: payload.nickname.clone(),
        avatar: payload.avatar.clone(),
        added_at: payload.added_at,
        profile_updated_at: payload.profile_updated_at,
    };
    let peer = secret.peer_key();

    match session.contacts.upsert(secret).await {
        UpsertOutcome::SkippedStale => {
            tracing::debug!(
                target: "sn_engine",
                event = "contact_share_stale",
                peer = %peer
            );
            Ok(ShareOutcome::SkippedStale)
        }
        UpsertOutcome::Applied => {
            let dropped = session
                .contacts
                .drop_pending_for(sender_digest, &payload.conversation.peer_device_id)
                .await;
            if dropped > 0 {
                tracing::debug!(
                    target: "sn_engine",
                    event = "pending_invites_superseded",
                    peer = %peer,
                    dropped
                );
            }
            persist_contact_blob(session).await;
            session.events.emit(EngineEvent::ContactsChanged);
            session
                .events
                .emit(EngineEvent::ContactEntryUpdated { peer: peer.clone() });
            Ok(ShareOutcome::Applied)
        }
    }
}

/// Refresh the MK-wrapped copies of the contact secrets: the local cache
/// and the remote backup the restore pipeline pulls on a fresh device.
/// Best-effort — a persistence failure never fails the share that
/// triggered it.
async fn persist_contact_blob(session: &Arc<Session>) {
    let Ok(master_key) = session.keyring.mk().await else {
        return;
    };
    let Ok(digest) = session.keyring.account_digest().await else {
        return;
    };
    let blob = match session.contacts.export_wrapped(&master_key).await {
        Ok(blob) => blob,
        Err(e) => {
            tracing::warn!(target: "sn_engine", event = "contact_blob_export_failed", error = %e);
            return;
        }
    };

    if let Some(cache) = &session.cache {
        if let Err(e) = cache.save_contact_blob(digest.as_str(), &blob).await {
            tracing::warn!(target: "sn_engine", event = "contact_blob_persist_failed", error = %e);
        }
    }

    let uplink = sn_proto::api::ContactsUplinkRequest {
        account_token: match session.keyring.account_token().await {
            Ok(t) => t,
            Err(_) => return,
        },
        account_digest: digest.to_string(),
        encrypted_blob: blob,
        is_blocked: false,
    };
    if let Err(e) = session.api.contacts_uplink(uplink).await {
        tracing::warn!(target: "sn_engine", event = "contact_blob_uplink_failed", error = %e);
    }
}
