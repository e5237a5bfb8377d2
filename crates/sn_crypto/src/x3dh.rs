//! X3DH-style asynchronous key agreement.
//!
//! The initiator fetches the peer's published bundle:
//!   IK_B  (identity, Ed25519 public → converted to X25519)
//!   SPK_B (signed prekey, X25519) + IK_B signature over SPK_B
//!   OPK_B (optional one-time prekey, consumed server-side per fetch)
//!
//! With one ephemeral keypair EK_A:
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OPK_B)      [only when the bundle carries an OPK]
//!
//!   SK = HKDF(DH1 || DH2 || DH3 [|| DH4], info = "x3dh/v1")
//!
//! The initiator emits `dr_init = { ek_pub, used_opk_id? }` alongside the
//! first ciphertext; the responder mirrors the DH set and derives the same
//! SK. The SPK_B signature MUST verify before any DH is computed. EK_A
//! doubles as the initiator's first ratchet key, which is what lets the
//! responder bootstrap its receiving chain from `DH(SPK_B_priv, ek_pub)`.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::{b64_decode_32, verify_spk_signature, IdentityKeyPair},
    kdf,
};

const X3DH_INFO: &[u8] = b"x3dh/v1";

// ── Key conversions ──────────────────────────────────────────────────────────

/// Convert an Ed25519 signing secret to an X25519 static secret using the
/// clamped SHA-512 expansion, mirroring libsignal's IK conversion.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    // Clamp per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key to X25519 via the birational map.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("Ed25519 public key decompression failed".into()))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

// ── Peer-facing prekey bundle ────────────────────────────────────────────────

/// What the key directory hands a session initiator. The server removes the
/// OPK from the pool on fetch; when the pool is dry the bundle simply omits
/// it and the handshake runs without DH4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    /// Ed25519 identity public key (base64)
    pub ik_pub: String,
    /// X25519 signed prekey (base64)
    pub spk_pub: String,
    /// Ed25519 signature over the raw SPK bytes (base64)
    pub spk_sig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opk_pub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opk_id: Option<u32>,
}

/// Initiator bootstrap blob, carried inside the contact-share that opens the
/// conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrInit {
    /// Initiator's ephemeral (and first ratchet) public key, base64.
    pub ek_pub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_opk_id: Option<u32>,
}

/// Output of the initiator handshake. `ek_secret` seeds the Double Ratchet
/// as the first sending ratchet key.
pub struct X3dhInitiation {
    pub shared_key: [u8; 32],
    pub ek_secret: StaticSecret,
    pub dr_init: DrInit,
}

// ── Initiator ────────────────────────────────────────────────────────────────

pub fn initiate(
    my_ik: &IdentityKeyPair,
    bundle: &PrekeyBundle,
) -> Result<X3dhInitiation, CryptoError> {
    let ik_b_ed = b64_decode_32(&bundle.ik_pub)?;
    let spk_b_raw = b64_decode_32(&bundle.spk_pub)?;
    let spk_sig = B64.decode(&bundle.spk_sig)?;

    // Signature check comes first; a forged SPK must never reach a DH.
    verify_spk_signature(&ik_b_ed, &spk_b_raw, &spk_sig)?;

    let ik_a_x = ed25519_secret_to_x25519(my_ik.secret_bytes());
    let ik_b_x = ed25519_pub_to_x25519(&ik_b_ed)?;
    let spk_b = X25519Public::from(spk_b_raw);

    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    let dh1 = ik_a_x.diffie_hellman(&spk_b);
    let dh2 = ek_a.diffie_hellman(&ik_b_x);
    let dh3 = ek_a.diffie_hellman(&spk_b);

    let mut ikm = Vec::with_capacity(4 * 32);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut used_opk_id = None;
    if let Some(ref opk_b64) = bundle.opk_pub {
        let opk_b = X25519Public::from(b64_decode_32(opk_b64)?);
        let dh4 = ek_a.diffie_hellman(&opk_b);
        ikm.extend_from_slice(dh4.as_bytes());
        used_opk_id = bundle.opk_id;
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, None, X3DH_INFO, &mut sk)?;
    ikm.zeroize();

    Ok(X3dhInitiation {
        shared_key: sk,
        dr_init: DrInit {
            ek_pub: B64.encode(ek_a_pub.as_bytes()),
            used_opk_id,
        },
        ek_secret: ek_a,
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Mirror the initiator's DH set and derive SK.
///
/// `initiator_ik_ed` is the initiator's Ed25519 identity public key, looked
/// up from the key directory by account digest.
pub fn respond(
    my_ik: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    initiator_ik_ed: &[u8; 32],
    dr_init: &DrInit,
) -> Result<[u8; 32], CryptoError> {
    let ek_a = X25519Public::from(b64_decode_32(&dr_init.ek_pub)?);
    let ik_a_x = ed25519_pub_to_x25519(initiator_ik_ed)?;
    let ik_b_x = ed25519_secret_to_x25519(my_ik.secret_bytes());

    // Same order as the initiator (DH is commutative per pair):
    let dh1 = my_spk_secret.diffie_hellman(&ik_a_x);
    let dh2 = ik_b_x.diffie_hellman(&ek_a);
    let dh3 = my_spk_secret.diffie_hellman(&ek_a);

    let mut ikm = Vec::with_capacity(4 * 32);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if dr_init.used_opk_id.is_some() {
        let opk = my_opk_secret.ok_or_else(|| {
            CryptoError::InvalidKey("handshake consumed an OPK this device no longer holds".into())
        })?;
        let dh4 = opk.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, None, X3DH_INFO, &mut sk)?;
    ikm.zeroize();

    Ok(sk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceKeyBundle;

    fn bundle_for(device: &DeviceKeyBundle, opk: Option<(u32, String)>) -> PrekeyBundle {
        PrekeyBundle {
            ik_pub: device.ik_public_b64(),
            spk_pub: device.spk_public_b64(),
            spk_sig: device.spk_sig_b64(),
            opk_pub: opk.as_ref().map(|(_, p)| p.clone()),
            opk_id: opk.map(|(id, _)| id),
        }
    }

    #[test]
    fn initiator_and_responder_derive_identical_sk_without_opk() {
        let alice = DeviceKeyBundle::generate(0);
        let bob = DeviceKeyBundle::generate(0);

        let init = initiate(&alice.identity(), &bundle_for(&bob, None)).unwrap();
        let sk_bob = respond(
            &bob.identity(),
            &bob.spk_secret(),
            None,
            alice.identity().public_bytes(),
            &init.dr_init,
        )
        .unwrap();

        assert_eq!(init.shared_key, sk_bob);
        assert!(init.dr_init.used_opk_id.is_none());
    }

    #[test]
    fn initiator_and_responder_derive_identical_sk_with_opk() {
        let alice = DeviceKeyBundle::generate(0);
        let mut bob = DeviceKeyBundle::generate(1);
        let opk_pub = bob.opks[0].public_b64();

        let init = initiate(&alice.identity(), &bundle_for(&bob, Some((0, opk_pub)))).unwrap();
        assert_eq!(init.dr_init.used_opk_id, Some(0));

        let opk = bob.take_opk(0).unwrap();
        let sk_bob = respond(
            &bob.identity(),
            &bob.spk_secret(),
            Some(&opk.secret()),
            alice.identity().public_bytes(),
            &init.dr_init,
        )
        .unwrap();

        assert_eq!(init.shared_key, sk_bob);
    }

    #[test]
    fn rejects_spk_signed_by_wrong_identity() {
        let alice = DeviceKeyBundle::generate(0);
        let bob = DeviceKeyBundle::generate(0);
        let mallory = DeviceKeyBundle::generate(0);

        let mut bundle = bundle_for(&bob, None);
        let spk_raw = b64_decode_32(&bundle.spk_pub).unwrap();
        bundle.spk_sig = B64.encode(mallory.identity().sign(&spk_raw));

        assert!(matches!(
            initiate(&alice.identity(), &bundle),
            Err(CryptoError::SignatureVerification)
        ));
    }

    #[test]
    fn responder_without_consumed_opk_secret_fails() {
        let alice = DeviceKeyBundle::generate(0);
        let mut bob = DeviceKeyBundle::generate(1);
        let opk_pub = bob.opks[0].public_b64();
        let init = initiate(&alice.identity(), &bundle_for(&bob, Some((0, opk_pub)))).unwrap();

        bob.take_opk(0); // lost before respond
        let err = respond(
            &bob.identity(),
            &bob.spk_secret(),
            None,
            alice.identity().public_bytes(),
            &init.dr_init,
        );
        assert!(err.is_err());
    }
}
