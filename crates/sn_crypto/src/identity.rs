//! Account and device identity material.
//!
//! An account is addressed by its `AccountDigest` — an opaque uppercase
//! 64-hex hash of the underlying uid. A device within an account is a string
//! id; the `(digest, device)` pair forms the unique session endpoint
//! (`PeerKey`). Digests are normalized at every boundary; anything that is
//! not 64 hex characters is rejected.
//!
//! The device private bundle carries the long-term Ed25519 identity key, the
//! X25519 signed prekey (public half signed by the identity key) and a batch
//! of one-time prekeys. The bundle never leaves the process in cleartext: it
//! is wrapped under the Master Key with the `devkeys/v1` info tag before the
//! server sees it.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    envelope::{self, SealedEnvelope, INFO_DEVKEYS},
    error::CryptoError,
};

// ── Account digest ───────────────────────────────────────────────────────────

/// Uppercase 64-hex account identifier. Construction normalizes case and
/// rejects anything else, so two digests compare equal iff they name the same
/// account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountDigest(String);

impl AccountDigest {
    pub fn parse(raw: &str) -> Result<Self, CryptoError> {
        let trimmed = raw.trim();
        if trimmed.len() != 64 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CryptoError::InvalidDigest(format!(
                "expected 64 hex chars, got {:?} ({} chars)",
                &trimmed[..trimmed.len().min(16)],
                trimmed.len()
            )));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AccountDigest {
    type Error = CryptoError;
    fn try_from(s: String) -> Result<Self, CryptoError> {
        Self::parse(&s)
    }
}

impl From<AccountDigest> for String {
    fn from(d: AccountDigest) -> String {
        d.0
    }
}

// ── Peer key ─────────────────────────────────────────────────────────────────

/// Unique session endpoint: `"<accountDigest>::<deviceId>"`. Kept opaque so
/// unequal-but-equivalent keys cannot be constructed by string concatenation
/// at call sites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey {
    digest: AccountDigest,
    device_id: String,
}

impl PeerKey {
    pub fn new(digest: AccountDigest, device_id: impl Into<String>) -> Self {
        Self {
            digest,
            device_id: device_id.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CryptoError> {
        let (digest, device) = raw.split_once("::").ok_or_else(|| {
            CryptoError::InvalidDigest(format!("peer key missing separator: {raw:?}"))
        })?;
        Ok(Self {
            digest: AccountDigest::parse(digest)?,
            device_id: device.to_string(),
        })
    }

    pub fn digest(&self) -> &AccountDigest {
        &self.digest
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.digest, self.device_id)
    }
}

// ── Identity keypair ─────────────────────────────────────────────────────────

/// Long-term Ed25519 identity signing key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    secret: [u8; 32],
    #[zeroize(skip)]
    public: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            public: signing.verifying_key().to_bytes(),
            secret: signing.to_bytes(),
        }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&secret);
        Self {
            public: signing.verifying_key().to_bytes(),
            secret,
        }
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn public_bytes(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn public_b64(&self) -> String {
        B64.encode(self.public)
    }

    /// Raw 64-byte Ed25519 signature over `msg`.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret).sign(msg).to_bytes().to_vec()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public: &[u8; 32], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(public)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig.try_into()
                .map_err(|_| CryptoError::InvalidKey("bad signature length".into()))?,
        );
        vk.verify(msg, &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

// ── One-time prekeys ─────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct OneTimePrekey {
    #[zeroize(skip)]
    pub id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    public: [u8; 32],
}

impl OneTimePrekey {
    fn generate(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            id,
            secret: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    pub fn public_b64(&self) -> String {
        B64.encode(self.public)
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}

// ── Device private bundle ────────────────────────────────────────────────────

/// Everything a device needs to answer X3DH handshakes. Stored server-side
/// only as an MK-wrapped blob.
#[derive(Serialize, Deserialize, ZeroizeOnDrop)]
pub struct DeviceKeyBundle {
    ik_secret: [u8; 32],
    #[zeroize(skip)]
    ik_public: [u8; 32],
    spk_secret: [u8; 32],
    #[zeroize(skip)]
    spk_public: [u8; 32],
    #[zeroize(skip)]
    spk_sig: Vec<u8>,
    #[zeroize(skip)]
    pub next_opk_id: u32,
    #[zeroize(skip)]
    pub opks: Vec<OneTimePrekey>,
}

impl DeviceKeyBundle {
    /// Fresh device bundle with `opk_count` one-time prekeys.
    pub fn generate(opk_count: u32) -> Self {
        let ik = IdentityKeyPair::generate();
        let spk_secret = StaticSecret::random_from_rng(OsRng);
        let spk_public = X25519Public::from(&spk_secret);
        let spk_sig = ik.sign(spk_public.as_bytes());

        let opks: Vec<OneTimePrekey> = (0..opk_count).map(OneTimePrekey::generate).collect();

        Self {
            ik_secret: *ik.secret_bytes(),
            ik_public: *ik.public_bytes(),
            spk_secret: spk_secret.to_bytes(),
            spk_public: spk_public.to_bytes(),
            spk_sig,
            next_opk_id: opk_count,
            opks,
        }
    }

    pub fn identity(&self) -> IdentityKeyPair {
        IdentityKeyPair::from_secret(self.ik_secret)
    }

    pub fn ik_public_b64(&self) -> String {
        B64.encode(self.ik_public)
    }

    pub fn spk_secret(&self) -> StaticSecret {
        StaticSecret::from(self.spk_secret)
    }

    pub fn spk_public(&self) -> X25519Public {
        X25519Public::from(self.spk_public)
    }

    pub fn spk_public_b64(&self) -> String {
        B64.encode(self.spk_public)
    }

    pub fn spk_sig_b64(&self) -> String {
        B64.encode(&self.spk_sig)
    }

    /// Append a fresh batch of one-time prekeys, advancing `next_opk_id`.
    pub fn replenish_opks(&mut self, count: u32) -> Vec<(u32, String)> {
        let mut published = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let opk = OneTimePrekey::generate(self.next_opk_id);
            published.push((opk.id, opk.public_b64()));
            self.opks.push(opk);
            self.next_opk_id += 1;
        }
        published
    }

    /// Take the secret for a consumed OPK out of the bundle. `None` when the
    /// id is unknown (already consumed or never published).
    pub fn take_opk(&mut self, id: u32) -> Option<OneTimePrekey> {
        let idx = self.opks.iter().position(|o| o.id == id)?;
        Some(self.opks.remove(idx))
    }

    /// Wrap the bundle under the Master Key for the server-side backup blob.
    pub fn wrap(&self, mk: &[u8; 32]) -> Result<SealedEnvelope, CryptoError> {
        envelope::wrap_json(self, mk, INFO_DEVKEYS)
    }

    pub fn unwrap(env: &SealedEnvelope, mk: &[u8; 32]) -> Result<Self, CryptoError> {
        envelope::unwrap_json(env, mk, &[INFO_DEVKEYS])
    }
}

impl Clone for DeviceKeyBundle {
    fn clone(&self) -> Self {
        Self {
            ik_secret: self.ik_secret,
            ik_public: self.ik_public,
            spk_secret: self.spk_secret,
            spk_public: self.spk_public,
            spk_sig: self.spk_sig.clone(),
            next_opk_id: self.next_opk_id,
            opks: self.opks.clone(),
        }
    }
}

/// Verify a peer's SPK signature against their identity key.
pub fn verify_spk_signature(
    ik_pub: &[u8; 32],
    spk_pub: &[u8; 32],
    spk_sig: &[u8],
) -> Result<(), CryptoError> {
    IdentityKeyPair::verify(ik_pub, spk_pub, spk_sig)
}

/// Decode a base64 string that must hold exactly 32 bytes.
pub fn b64_decode_32(s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = B64.decode(s)?;
    let mut out = [0u8; 32];
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidKey(format!(
            "expected 32-byte key, got {}",
            bytes.len()
        )));
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12";

    #[test]
    fn digest_normalizes_to_uppercase() {
        let d = AccountDigest::parse(DIGEST).unwrap();
        assert_eq!(d.as_str(), DIGEST.to_ascii_uppercase());
    }

    #[test]
    fn digest_rejects_bad_input() {
        assert!(AccountDigest::parse("not-hex").is_err());
        assert!(AccountDigest::parse(&DIGEST[..62]).is_err());
        assert!(AccountDigest::parse(&format!("{DIGEST}ff")).is_err());
    }

    #[test]
    fn peer_key_roundtrip() {
        let pk = PeerKey::new(AccountDigest::parse(DIGEST).unwrap(), "device-7");
        let parsed = PeerKey::parse(&pk.to_string()).unwrap();
        assert_eq!(pk, parsed);
        assert_eq!(parsed.device_id(), "device-7");
    }

    #[test]
    fn device_bundle_spk_signature_verifies() {
        let bundle = DeviceKeyBundle::generate(2);
        verify_spk_signature(
            &b64_decode_32(&bundle.ik_public_b64()).unwrap(),
            bundle.spk_public().as_bytes(),
            &B64.decode(bundle.spk_sig_b64()).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn device_bundle_wrap_unwrap() {
        let mk = [0x5au8; 32];
        let bundle = DeviceKeyBundle::generate(3);
        let env = bundle.wrap(&mk).unwrap();
        let back = DeviceKeyBundle::unwrap(&env, &mk).unwrap();
        assert_eq!(back.next_opk_id, 3);
        assert_eq!(back.opks.len(), 3);
        assert_eq!(back.ik_public_b64(), bundle.ik_public_b64());
    }

    #[test]
    fn opk_take_consumes_once() {
        let mut bundle = DeviceKeyBundle::generate(1);
        assert!(bundle.take_opk(0).is_some());
        assert!(bundle.take_opk(0).is_none());
    }

    #[test]
    fn replenish_advances_ids() {
        let mut bundle = DeviceKeyBundle::generate(2);
        let published = bundle.replenish_opks(3);
        assert_eq!(published.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(bundle.next_opk_id, 5);
        assert_eq!(bundle.opks.len(), 5);
    }
}
