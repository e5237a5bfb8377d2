//! Packet classification: raw server packets → canonical replay items.
//!
//! The server stores opaque blobs plus routing fields; before anything is
//! decrypted the pipeline normalizes each packet:
//!   - resolve the message id (UUIDv4 from authoritative slots, else the
//!     deterministic `gap:v1:<counter>` placeholder),
//!   - extract the DR header from `header.dr` and reject fallback packets,
//!   - resolve the counter (transport field wins over the header copy),
//!   - determine direction against the local identity,
//!   - classify the kind (user message / control state / transient signal).
//!
//! Batches are sorted by `(sender_device_id, counter)` ascending — within one
//! sender the counter order is the sole correctness criterion — with the
//! timestamp only breaking ties across senders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sn_crypto::envelope::SealedEnvelope;
use sn_crypto::identity::{AccountDigest, PeerKey};
use sn_crypto::ratchet::DrHeader;

use crate::{api::RawPacket, error::ProtoError};

/// Placeholder message-id prefix for gap-filled packets whose authoritative
/// UUID is not yet known.
pub const GAP_ID_PREFIX: &str = "gap:v1:";

// ── Local identity ───────────────────────────────────────────────────────────

/// What the pipeline compares packets against to resolve direction.
#[derive(Debug, Clone)]
pub struct SelfIdentity {
    pub account_digest: AccountDigest,
    pub device_id: String,
}

// ── Classification results ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    UserMessage,
    ControlState,
    TransientSignal,
}

/// Canonical unit of work for both the replay and the live route.
#[derive(Debug, Clone)]
pub struct ReplayItem {
    pub message_id: String,
    pub conversation_id: String,
    pub header: DrHeader,
    pub ciphertext_b64: String,
    /// Resolved transport counter.
    pub counter: u64,
    pub sender_device_id: String,
    pub sender_digest: Option<AccountDigest>,
    pub receiver_digest: Option<AccountDigest>,
    pub receiver_device_id: Option<String>,
    pub direction: Direction,
    pub kind: PacketKind,
    pub msg_type: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Wrapped message key the server returned in-batch, if any.
    pub server_key: Option<SealedEnvelope>,
}

impl ReplayItem {
    /// The remote endpoint of this item: the sender for incoming packets,
    /// the receiver for our own outgoing ones.
    pub fn peer_key(&self) -> Option<PeerKey> {
        match self.direction {
            Direction::Incoming => self
                .sender_digest
                .clone()
                .map(|d| PeerKey::new(d, self.sender_device_id.clone())),
            Direction::Outgoing => match (&self.receiver_digest, &self.receiver_device_id) {
                (Some(d), Some(dev)) => Some(PeerKey::new(d.clone(), dev.clone())),
                _ => None,
            },
        }
    }

    pub fn has_placeholder_id(&self) -> bool {
        self.message_id.starts_with(GAP_ID_PREFIX)
    }
}

/// A packet the pipeline refused. Kept beside decrypted items so the UI can
/// render a placeholder instead of silently losing a row.
#[derive(Debug, Clone)]
pub struct DroppedPacket {
    pub message_id: String,
    pub conversation_id: String,
    pub reason: String,
}

// ── Resolution ───────────────────────────────────────────────────────────────

/// `true` only for a well-formed v4 UUID — the sole authoritative id shape.
pub fn is_authoritative_id(id: &str) -> bool {
    Uuid::parse_str(id)
        .map(|u| u.get_version_num() == 4)
        .unwrap_or(false)
}

pub fn gap_placeholder_id(counter: u64) -> String {
    format!("{GAP_ID_PREFIX}{counter}")
}

/// Normalize one raw packet. Returns `Err` for packets the secure pipeline
/// cannot process; the caller converts those into `DroppedPacket` records.
pub fn resolve(raw: &RawPacket, me: &SelfIdentity) -> Result<ReplayItem, ProtoError> {
    // Fallback (non-ratchet) payloads never enter the DR pipeline.
    if raw.header.get("fallback").is_some()
        || raw.msg_type.as_deref() == Some("fallback")
    {
        return Err(ProtoError::FallbackRejected);
    }

    let dr_value = raw.header.get("dr").ok_or(ProtoError::MissingDrHeader)?;
    let header: DrHeader =
        serde_json::from_value(dr_value.clone()).map_err(|_| ProtoError::MissingDrHeader)?;

    let sender_device_id = raw
        .sender_device_id
        .clone()
        .or_else(|| Some(header.device_id.clone()).filter(|d| !d.is_empty()))
        .ok_or(ProtoError::MissingSenderDevice)?;

    // Transport counter wins over the header copy.
    let counter = raw
        .counter
        .or(Some(header.counter).filter(|c| *c > 0))
        .ok_or(ProtoError::MissingCounter)?;

    let message_id = match raw.id.as_deref() {
        Some(id) if is_authoritative_id(id) => id.to_string(),
        _ => gap_placeholder_id(counter),
    };

    let sender_digest = raw
        .sender_digest
        .as_deref()
        .map(AccountDigest::parse)
        .transpose()?;
    let receiver_digest = raw
        .receiver_digest
        .as_deref()
        .map(AccountDigest::parse)
        .transpose()?;

    let direction = resolve_direction(raw, &sender_device_id, sender_digest.as_ref(), me);
    let kind = classify(raw.msg_type.as_deref());

    Ok(ReplayItem {
        message_id,
        conversation_id: raw.conversation_id.clone(),
        header,
        ciphertext_b64: raw.ciphertext_b64.clone(),
        counter,
        sender_device_id,
        sender_digest,
        receiver_digest,
        receiver_device_id: raw.receiver_device_id.clone(),
        direction,
        kind,
        msg_type: raw.msg_type.clone(),
        created_at: raw.created_at,
        server_key: raw.wrapped_mk.clone(),
    })
}

fn resolve_direction(
    raw: &RawPacket,
    sender_device_id: &str,
    sender_digest: Option<&AccountDigest>,
    me: &SelfIdentity,
) -> Direction {
    if sender_device_id == me.device_id
        && sender_digest.map(|d| d == &me.account_digest).unwrap_or(true)
    {
        return Direction::Outgoing;
    }
    if raw.receiver_device_id.as_deref() == Some(me.device_id.as_str()) {
        return Direction::Incoming;
    }
    match sender_digest {
        Some(d) if d == &me.account_digest => Direction::Outgoing,
        _ => Direction::Incoming,
    }
}

fn classify(msg_type: Option<&str>) -> PacketKind {
    match msg_type {
        Some(t) if t.starts_with("control/") => PacketKind::ControlState,
        Some("receipt") | Some("read-state") => PacketKind::ControlState,
        Some(t) if t.starts_with("transient/") => PacketKind::TransientSignal,
        Some("typing") | Some("presence") => PacketKind::TransientSignal,
        _ => PacketKind::UserMessage,
    }
}

/// Resolve a whole batch, splitting out dropped packets, and sort the
/// survivors into processing order.
pub fn resolve_batch(
    raws: &[RawPacket],
    me: &SelfIdentity,
) -> (Vec<ReplayItem>, Vec<DroppedPacket>) {
    let mut items = Vec::with_capacity(raws.len());
    let mut dropped = Vec::new();
    for raw in raws {
        match resolve(raw, me) {
            Ok(item) => items.push(item),
            Err(e) => dropped.push(DroppedPacket {
                message_id: raw
                    .id
                    .clone()
                    .or_else(|| raw.counter.map(gap_placeholder_id))
                    .unwrap_or_else(|| "unresolved".into()),
                conversation_id: raw.conversation_id.clone(),
                reason: e.to_string(),
            }),
        }
    }
    sort_batch(&mut items);
    (items, dropped)
}

/// Primary order `(sender_device_id, counter)` ascending; timestamp breaks
/// ties across senders only.
pub fn sort_batch(items: &mut [ReplayItem]) {
    items.sort_by(|a, b| {
        a.sender_device_id
            .cmp(&b.sender_device_id)
            .then(a.counter.cmp(&b.counter))
            .then(a.created_at.cmp(&b.created_at))
    });
}
