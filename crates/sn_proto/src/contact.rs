//! Contact-share payloads.
//!
//! A contact-share is the small encrypted side-channel that bootstraps a DR
//! session (carrying the `dr_init` blob and the conversation token) and
//! propagates profile updates afterwards. The very first exchange is sealed
//! under the one-time invite secret; every later share for the same
//! conversation is sealed under the conversation token.
//!
//! Payloads are padded to fixed buckets before sealing so relay-side sizes
//! do not track profile growth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sn_crypto::envelope::{self, SealedEnvelope, INFO_CONTACT};
use sn_crypto::x3dh::DrInit;

use crate::error::ProtoError;

// ── Payload ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactConversation {
    /// Conversation token (base64) — symmetric secret for follow-up shares.
    pub token_b64: String,
    pub conversation_id: String,
    /// Present on session-opening shares only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dr_init: Option<DrInit>,
    pub peer_device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSharePayload {
    /// Always `"contact-share"`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub conversation: ContactConversation,
    pub added_at: DateTime<Utc>,
    pub profile_updated_at: DateTime<Utc>,
}

pub const CONTACT_SHARE_KIND: &str = "contact-share";

// ── Padding ──────────────────────────────────────────────────────────────────
// Format: [original_len: u32 LE][payload][random padding up to the bucket].

const BUCKET_SIZES: &[usize] = &[256, 512, 1024];

pub fn pad_to_bucket(plaintext: &[u8]) -> Vec<u8> {
    let needed = 4 + plaintext.len();
    let target = BUCKET_SIZES
        .iter()
        .copied()
        .find(|&b| b >= needed)
        .unwrap_or(needed);

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(plaintext);
    let remaining = target.saturating_sub(out.len());
    if remaining > 0 {
        use rand::RngCore;
        let mut padding = vec![0u8; remaining];
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    out
}

pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if padded.len() < 4 {
        return Err(ProtoError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(ProtoError::InvalidPadding(format!(
            "length prefix {len} exceeds padded size {}",
            padded.len()
        )));
    }
    Ok(padded[4..4 + len].to_vec())
}

// ── Seal / open ──────────────────────────────────────────────────────────────

/// Seal a contact-share under the invite secret or the conversation token.
pub fn seal_payload(
    payload: &ContactSharePayload,
    key32: &[u8; 32],
) -> Result<SealedEnvelope, ProtoError> {
    let json = serde_json::to_vec(payload)?;
    let padded = pad_to_bucket(&json);
    Ok(envelope::encrypt(&padded, key32, INFO_CONTACT)?)
}

pub fn open_payload(
    env: &SealedEnvelope,
    key32: &[u8; 32],
) -> Result<ContactSharePayload, ProtoError> {
    let padded = envelope::decrypt(env, key32, &[INFO_CONTACT])?;
    let json = unpad(&padded)?;
    Ok(serde_json::from_slice(&json)?)
}
