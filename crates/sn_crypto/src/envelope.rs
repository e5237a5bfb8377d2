//! Authenticated Encryption with Associated Data
//!
//! Two surfaces:
//!   - `SealedEnvelope` — the strict JSON envelope used for every wrap/unwrap
//!     call site (profile blobs, contact secrets, vaulted message keys,
//!     wrapped device keys). A random 16-byte salt feeds HKDF-SHA256 over the
//!     caller's 32-byte key with the `info` tag as domain separator, then
//!     AES-256-GCM seals under the derived sub-key.
//!   - `seal`/`open` — raw AES-256-GCM with caller-supplied IV and AAD, used
//!     by the Double Ratchet message path where the IV travels in the header
//!     and the AAD binds header fields.
//!
//! Envelope wire format (order-insensitive JSON):
//!   { v, aead: "aes-256-gcm", iv_b64, salt_b64, info, ct_b64 }
//!
//! Unknown top-level fields are tolerated on input but never re-emitted.
//! Missing required fields fail closed. The 16-byte GCM tag is appended to
//! the ciphertext. Base64 is the standard alphabet, padding preserved.

use std::collections::BTreeMap;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::{error::CryptoError, kdf};

pub const AEAD_NAME: &str = "aes-256-gcm";
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;

// ── Info tags ────────────────────────────────────────────────────────────────
// Every call site passes one of these; anything else is rejected at both the
// encrypt and decrypt boundary.

pub const INFO_PROFILE: &str = "profile/v1";
pub const INFO_CONTACT: &str = "contact/v1";
pub const INFO_MEDIA: &str = "media/v1";
pub const INFO_MESSAGE_KEY: &str = "message-key/v1";
pub const INFO_DEVKEYS: &str = "devkeys/v1";
pub const INFO_BACKUP: &str = "backup/v1";
pub const INFO_DR_STATE: &str = "dr-state/v1";

const KNOWN_INFOS: &[&str] = &[
    INFO_PROFILE,
    INFO_CONTACT,
    INFO_MEDIA,
    INFO_MESSAGE_KEY,
    INFO_DEVKEYS,
    INFO_BACKUP,
    INFO_DR_STATE,
];

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub v: u8,
    pub aead: String,
    pub iv_b64: String,
    pub salt_b64: String,
    pub info: String,
    pub ct_b64: String,
    /// Unknown input fields land here and are dropped on output.
    #[serde(flatten, skip_serializing)]
    extra: BTreeMap<String, serde_json::Value>,
}

/// Seal `plaintext` under a sub-key derived from `key32`, `info` and a fresh
/// random salt.
pub fn encrypt(plaintext: &[u8], key32: &[u8; 32], info: &str) -> Result<SealedEnvelope, CryptoError> {
    if !KNOWN_INFOS.contains(&info) {
        return Err(CryptoError::InfoNotAllowed(info.to_string()));
    }

    use rand::RngCore;
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let mut sub_key = [0u8; 32];
    kdf::hkdf_expand(key32, Some(&salt), info.as_bytes(), &mut sub_key)?;

    let cipher = Aes256Gcm::new_from_slice(&sub_key).map_err(|_| CryptoError::AeadEncrypt)?;
    let ct = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::AeadEncrypt)?;
    sub_key.zeroize();

    Ok(SealedEnvelope {
        v: 1,
        aead: AEAD_NAME.to_string(),
        iv_b64: B64.encode(iv),
        salt_b64: B64.encode(salt),
        info: info.to_string(),
        ct_b64: B64.encode(&ct),
        extra: BTreeMap::new(),
    })
}

/// Open an envelope. `allowed_infos` is the call-site allow-list; envelopes
/// carrying any other tag are rejected before touching the cipher.
pub fn decrypt(
    envelope: &SealedEnvelope,
    key32: &[u8; 32],
    allowed_infos: &[&str],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if envelope.aead != AEAD_NAME {
        return Err(CryptoError::EnvelopeMalformed(format!(
            "unsupported aead {:?}",
            envelope.aead
        )));
    }
    if envelope.v != 1 && envelope.v != 2 {
        return Err(CryptoError::EnvelopeMalformed(format!(
            "unsupported version {}",
            envelope.v
        )));
    }
    if !allowed_infos.contains(&envelope.info.as_str()) {
        return Err(CryptoError::InfoNotAllowed(envelope.info.clone()));
    }

    let salt = B64.decode(&envelope.salt_b64)?;
    let iv = B64.decode(&envelope.iv_b64)?;
    if salt.len() != SALT_LEN {
        return Err(CryptoError::EnvelopeMalformed(format!(
            "salt must be {SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }
    if iv.len() != IV_LEN {
        return Err(CryptoError::EnvelopeMalformed(format!(
            "iv must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }
    let ct = B64.decode(&envelope.ct_b64)?;

    let mut sub_key = [0u8; 32];
    kdf::hkdf_expand(key32, Some(&salt), envelope.info.as_bytes(), &mut sub_key)?;

    let cipher = Aes256Gcm::new_from_slice(&sub_key).map_err(|_| CryptoError::IntegrityFailure)?;
    let pt = cipher
        .decrypt(Nonce::from_slice(&iv), ct.as_slice())
        .map_err(|_| CryptoError::IntegrityFailure)?;
    sub_key.zeroize();

    Ok(Zeroizing::new(pt))
}

/// Serialise `value` to JSON and seal it.
pub fn wrap_json<T: Serialize>(
    value: &T,
    key32: &[u8; 32],
    info: &str,
) -> Result<SealedEnvelope, CryptoError> {
    let bytes = serde_json::to_vec(value)?;
    encrypt(&bytes, key32, info)
}

/// Open an envelope and deserialise the plaintext JSON.
pub fn unwrap_json<T: DeserializeOwned>(
    envelope: &SealedEnvelope,
    key32: &[u8; 32],
    allowed_infos: &[&str],
) -> Result<T, CryptoError> {
    let bytes = decrypt(envelope, key32, allowed_infos)?;
    Ok(serde_json::from_slice(&bytes)?)
}

// ── Raw AEAD (Double Ratchet message path) ───────────────────────────────────

/// AES-256-GCM seal with explicit IV and associated data. Tag appended.
pub fn seal(key32: &[u8; 32], iv: &[u8; IV_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key32).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)
}

/// AES-256-GCM open. Any tag or AAD mismatch is an `IntegrityFailure`.
pub fn open(
    key32: &[u8; 32],
    iv: &[u8; IV_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key32).map_err(|_| CryptoError::IntegrityFailure)?;
    let pt = cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::IntegrityFailure)?;
    Ok(Zeroizing::new(pt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let key = [7u8; 32];
        let env = encrypt(b"hello sealed world", &key, INFO_CONTACT).unwrap();
        assert_eq!(env.aead, AEAD_NAME);
        assert_eq!(env.v, 1);
        let pt = decrypt(&env, &key, &[INFO_CONTACT]).unwrap();
        assert_eq!(&*pt, b"hello sealed world");
    }

    #[test]
    fn envelope_rejects_info_outside_allow_list() {
        let key = [7u8; 32];
        let env = encrypt(b"x", &key, INFO_CONTACT).unwrap();
        let err = decrypt(&env, &key, &[INFO_PROFILE]).unwrap_err();
        assert!(matches!(err, CryptoError::InfoNotAllowed(_)));
    }

    #[test]
    fn envelope_bit_flip_is_integrity_failure() {
        let key = [9u8; 32];
        let mut env = encrypt(b"payload", &key, INFO_MEDIA).unwrap();
        let mut ct = B64.decode(&env.ct_b64).unwrap();
        ct[0] ^= 0x01;
        env.ct_b64 = B64.encode(&ct);
        let err = decrypt(&env, &key, &[INFO_MEDIA]).unwrap_err();
        assert!(matches!(err, CryptoError::IntegrityFailure));
    }

    #[test]
    fn envelope_iv_flip_is_integrity_failure() {
        let key = [9u8; 32];
        let mut env = encrypt(b"payload", &key, INFO_MEDIA).unwrap();
        let mut iv = B64.decode(&env.iv_b64).unwrap();
        iv[3] ^= 0x80;
        env.iv_b64 = B64.encode(&iv);
        let err = decrypt(&env, &key, &[INFO_MEDIA]).unwrap_err();
        assert!(matches!(err, CryptoError::IntegrityFailure));
    }

    #[test]
    fn envelope_rejects_wrong_aead_name() {
        let key = [1u8; 32];
        let mut env = encrypt(b"x", &key, INFO_PROFILE).unwrap();
        env.aead = "aes-128-gcm".into();
        assert!(matches!(
            decrypt(&env, &key, &[INFO_PROFILE]),
            Err(CryptoError::EnvelopeMalformed(_))
        ));
    }

    #[test]
    fn unknown_fields_tolerated_but_not_reemitted() {
        let key = [3u8; 32];
        let env = encrypt(b"data", &key, INFO_PROFILE).unwrap();
        let mut val = serde_json::to_value(&env).unwrap();
        val["legacy_hint"] = serde_json::json!("ignore-me");
        let parsed: SealedEnvelope = serde_json::from_value(val).unwrap();
        let out = serde_json::to_value(&parsed).unwrap();
        assert!(out.get("legacy_hint").is_none());
        let pt = decrypt(&parsed, &key, &[INFO_PROFILE]).unwrap();
        assert_eq!(&*pt, b"data");
    }

    #[test]
    fn missing_required_field_fails_closed() {
        let bad = serde_json::json!({
            "v": 1,
            "aead": "aes-256-gcm",
            "iv_b64": "AAAA",
            "info": "profile/v1",
            "ct_b64": "AAAA"
        });
        assert!(serde_json::from_value::<SealedEnvelope>(bad).is_err());
    }

    #[test]
    fn wrap_unwrap_json() {
        let key = [5u8; 32];
        let value = serde_json::json!({ "nickname": "kestrel", "n": 42 });
        let env = wrap_json(&value, &key, INFO_CONTACT).unwrap();
        let back: serde_json::Value = unwrap_json(&env, &key, &[INFO_CONTACT]).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn raw_seal_open_binds_aad() {
        let key = [2u8; 32];
        let iv = [4u8; IV_LEN];
        let ct = seal(&key, &iv, b"v:1;d:dev;c:9", b"msg").unwrap();
        assert_eq!(&*open(&key, &iv, b"v:1;d:dev;c:9", &ct).unwrap(), b"msg");
        assert!(matches!(
            open(&key, &iv, b"v:1;d:dev;c:10", &ct),
            Err(CryptoError::IntegrityFailure)
        ));
    }
}
