//! API request/response types shared with the message server.
//! These map directly to JSON bodies on the wire.
//!
//! Every request additionally carries the identity headers
//! (`X-Account-Token`, `X-Account-Digest`, `X-Device-Id`); bodies duplicate
//! token and digest for request signing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sn_crypto::envelope::SealedEnvelope;
use sn_crypto::x3dh::PrekeyBundle;

pub const HEADER_ACCOUNT_TOKEN: &str = "X-Account-Token";
pub const HEADER_ACCOUNT_DIGEST: &str = "X-Account-Digest";
pub const HEADER_DEVICE_ID: &str = "X-Device-Id";

// ── Credential exchange ──────────────────────────────────────────────────────

/// One-shot exchange of the physical credential's dynamic message for the
/// account token. The server releases the per-account `mk_seed` only on a
/// valid, fresh (counter-checked) credential read.
#[derive(Debug, Serialize, Deserialize)]
pub struct SdmExchangeRequest {
    pub uid: String,
    pub sdmmac: String,
    pub sdmcounter: u64,
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdmExchangeResponse {
    pub account_token: String,
    pub account_digest: String,
    /// Per-account Master Key seed (base64). Mixed with the account token
    /// via HKDF; the server never sees the resulting MK in use.
    pub mk_seed_b64: String,
    /// Present when the account already has a wrapped MK copy stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_mk: Option<SealedEnvelope>,
}

// ── Key directory ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct OpkUpload {
    pub id: u32,
    pub pub_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishKeysRequest {
    pub account_token: String,
    pub account_digest: String,
    pub ik_pub: String,
    pub spk_pub: String,
    pub spk_sig: String,
    pub opks: Vec<OpkUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishKeysResponse {
    /// How many one-time prekeys the server still holds unconsumed.
    pub unused_opk_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BundleRequest {
    pub account_token: String,
    pub account_digest: String,
    pub peer_account_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleResponse {
    pub device_id: String,
    pub bundle: PrekeyBundle,
}

// ── Wrapped device-key backup ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct DevKeysStoreRequest {
    pub account_token: String,
    pub account_digest: String,
    pub wrapped_dev: SealedEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevKeysFetchResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_dev: Option<SealedEnvelope>,
}

// ── Secure messages ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSecureRequest {
    pub account_token: String,
    pub account_digest: String,
    pub conversation_id: String,
    /// UUID assigned at send time; the authoritative message id.
    pub id: String,
    /// DR header, serialized under the `dr` key.
    pub header: serde_json::Value,
    pub ciphertext_b64: String,
    /// Sender's monotone transport counter.
    pub counter: u64,
    pub sender_device_id: String,
    pub receiver_digest: String,
    pub receiver_device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSecureResponse {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// One stored packet, as listed by the server. Everything the server knows:
/// routing fields and opaque blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPacket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub conversation_id: String,
    /// Opaque header JSON; DR packets carry the ratchet header under `dr`.
    pub header: serde_json::Value,
    pub ciphertext_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Vaulted message key for this packet, included on `includeKeys=true`
    /// list calls so bulk replay avoids one round-trip per message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_mk: Option<SealedEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSecureQuery {
    pub conversation_id: String,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_id: Option<String>,
    pub include_keys: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListSecureResponse {
    pub packets: Vec<RawPacket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByCounterQuery {
    pub conversation_id: String,
    pub counter: u64,
    pub sender_device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxCounterQuery {
    pub conversation_id: String,
    pub sender_device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxCounterResponse {
    pub max_counter: u64,
}

// ── Message key vault ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultPutRequest {
    pub account_token: String,
    pub account_digest: String,
    pub conversation_id: String,
    pub message_id: String,
    pub sender_device_id: String,
    pub wrapped_mk: SealedEnvelope,
    /// Hash of the wrapped key bytes; lets the server detect a re-put that
    /// carries different material without reading the blob.
    pub wrap_digest: String,
    /// Direction and counter metadata the server can index on without
    /// learning anything about the plaintext.
    pub direction: String,
    pub header_counter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dr_state: Option<SealedEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultPutResponse {
    pub duplicate: bool,
    /// Set when the slot exists with a different wrap digest.
    #[serde(default)]
    pub conflict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultGetRequest {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultGetResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_mk: Option<SealedEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dr_state: Option<SealedEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultDirectionState {
    pub header_counter: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultLatestStateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming: Option<VaultDirectionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing: Option<VaultDirectionState>,
}

// ── Contacts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ContactsUplinkRequest {
    pub account_token: String,
    pub account_digest: String,
    pub encrypted_blob: SealedEnvelope,
    pub is_blocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactsDownlinkResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_blob: Option<SealedEnvelope>,
}

// ── Common ───────────────────────────────────────────────────────────────────

/// Error body returned by any endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub code: String,
}

/// Server rejection code when a device's send counter lags `max_counter`.
pub const CODE_COUNTER_TOO_LOW: &str = "COUNTER_TOO_LOW";
