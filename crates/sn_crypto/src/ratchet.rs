//! Double Ratchet with DH ratchet steps.
//!
//! State separation:
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, handed to the vault)
//!
//! Two counter families coexist:
//!   `n` / `pn`        — 0-based index within the current/previous chain,
//!                        reset on every DH ratchet step (classic DR).
//!   `counter`          — 1-based transport counter (`ns_total`/`nr_total`),
//!                        monotone across ratchets. This is what the server
//!                        orders by and what gap detection compares against.
//!
//! Commit discipline: `decrypt` mutates the state in place. Callers that
//! need the advance to be conditional on durable key storage take a
//! `snapshot()` first and restore it on failure — `nr_total` must never
//! outrun the message-key vault.
//!
//! Skipped message keys are bounded per chain and in total; eviction is
//! oldest-first and evicted keys are unrecoverable.

use std::collections::VecDeque;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    envelope,
    error::CryptoError,
    identity::{b64_decode_32, AccountDigest},
    kdf,
};

pub const MAX_SKIP_PER_CHAIN: usize = 1000;
pub const MAX_SKIP_TOTAL: usize = 2000;

// ── Header ───────────────────────────────────────────────────────────────────

/// Sent unencrypted alongside every ciphertext. The associated data for the
/// AEAD is derived from it, so any in-flight change breaks decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrHeader {
    pub v: u8,
    /// Sender's device id.
    pub device_id: String,
    /// Message number in the current sending chain (resets per ratchet).
    pub n: u64,
    /// Length of the previous sending chain.
    pub pn: u64,
    /// Monotone transport counter (1-based, never resets).
    pub counter: u64,
    /// Sender's current DH ratchet public key (base64).
    pub ratchet_pub: String,
    /// AES-GCM IV for this message (base64, 12 bytes).
    pub iv_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Canonical associated data: `v:<ver>;d:<senderDeviceId>;c:<headerCounter>`.
/// ASCII, no whitespace. Binds sender device and transport counter to the
/// ciphertext as replay protection.
pub fn canonical_aad(v: u8, sender_device_id: &str, header_counter: u64) -> String {
    format!("v:{v};d:{sender_device_id};c:{header_counter}")
}

impl DrHeader {
    pub fn aad(&self) -> String {
        canonical_aad(self.v, &self.device_id, self.counter)
    }
}

// ── Session base key ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

/// Immutable conversation binding carried inside each DR state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBaseKey {
    pub conversation_id: String,
    pub peer_account_digest: AccountDigest,
    pub peer_device_id: String,
    pub role: Role,
    /// Conversation token (base64) — the symmetric secret that seals
    /// follow-up contact-shares for this conversation.
    pub conversation_token_b64: String,
}

// ── Skipped-key table ────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
struct SkippedEntry {
    /// Base64 ratchet public key identifying the receive chain.
    chain: String,
    n: u64,
    #[serde(with = "b64_key")]
    mk: [u8; 32],
}

/// Insertion-ordered skipped message keys, bounded per chain and in total.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SkippedKeys {
    entries: VecDeque<SkippedEntry>,
}

impl SkippedKeys {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn chain_len(&self, chain: &str) -> usize {
        self.entries.iter().filter(|e| e.chain == chain).count()
    }

    fn take(&mut self, chain: &str, n: u64) -> Option<[u8; 32]> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.chain == chain && e.n == n)?;
        self.entries.remove(idx).map(|e| e.mk)
    }

    /// Insert, evicting oldest-first: the per-chain cap is enforced before
    /// the total cap. Evicted keys are zeroized and permanently gone.
    fn insert(&mut self, chain: String, n: u64, mk: [u8; 32]) {
        while self.chain_len(&chain) >= MAX_SKIP_PER_CHAIN {
            if let Some(idx) = self.entries.iter().position(|e| e.chain == chain) {
                if let Some(mut evicted) = self.entries.remove(idx) {
                    evicted.mk.zeroize();
                }
            }
        }
        while self.entries.len() >= MAX_SKIP_TOTAL {
            if let Some(mut evicted) = self.entries.pop_front() {
                evicted.mk.zeroize();
            }
        }
        self.entries.push_back(SkippedEntry { chain, n, mk });
    }
}

impl Drop for SkippedKeys {
    fn drop(&mut self) {
        for e in self.entries.iter_mut() {
            e.mk.zeroize();
        }
    }
}

// ── DR state ─────────────────────────────────────────────────────────────────

/// Complete Double Ratchet session state for one peer endpoint. At most one
/// exists per `PeerKey`; mutation is serialized by the live coordinator's
/// per-peer lock.
#[derive(Clone, Serialize, Deserialize)]
pub struct DrState {
    #[serde(with = "b64_key")]
    rk: [u8; 32],
    #[serde(with = "b64_key_opt")]
    ck_send: Option<[u8; 32]>,
    #[serde(with = "b64_key_opt")]
    ck_recv: Option<[u8; 32]>,

    pub ns: u64,
    pub nr: u64,
    pub pn: u64,
    pub ns_total: u64,
    pub nr_total: u64,

    #[serde(with = "b64_key")]
    my_ratchet_secret: [u8; 32],
    #[serde(with = "b64_key")]
    my_ratchet_pub: [u8; 32],
    #[serde(with = "b64_key_opt")]
    their_ratchet_pub: Option<[u8; 32]>,

    skipped: SkippedKeys,

    pub base: SessionBaseKey,
    pub pending_send_ratchet: bool,
}

impl Drop for DrState {
    fn drop(&mut self) {
        self.rk.zeroize();
        if let Some(ref mut ck) = self.ck_send {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.ck_recv {
            ck.zeroize();
        }
        self.my_ratchet_secret.zeroize();
    }
}

impl DrState {
    /// Initiator side: the X3DH ephemeral doubles as the first ratchet key,
    /// and the first sending chain is rooted in `DH(EK_A, SPK_B)`.
    pub fn new_initiator(
        shared_key: [u8; 32],
        ek_secret: StaticSecret,
        their_spk_pub: &X25519Public,
        base: SessionBaseKey,
    ) -> Result<Self, CryptoError> {
        let my_pub = X25519Public::from(&ek_secret);
        let dh = ek_secret.diffie_hellman(their_spk_pub);
        let (rk, ck_send) = kdf::kdf_rk(&shared_key, dh.as_bytes())?;

        Ok(Self {
            rk,
            ck_send: Some(ck_send),
            ck_recv: None,
            ns: 0,
            nr: 0,
            pn: 0,
            ns_total: 0,
            nr_total: 0,
            my_ratchet_secret: ek_secret.to_bytes(),
            my_ratchet_pub: my_pub.to_bytes(),
            their_ratchet_pub: Some(their_spk_pub.to_bytes()),
            skipped: SkippedKeys::default(),
            base,
            pending_send_ratchet: false,
        })
    }

    /// Responder side: the SPK secret is the initial ratchet key. Chains are
    /// established when the initiator's first header arrives.
    pub fn new_responder(
        shared_key: [u8; 32],
        spk_secret: StaticSecret,
        base: SessionBaseKey,
    ) -> Self {
        let my_pub = X25519Public::from(&spk_secret);
        Self {
            rk: shared_key,
            ck_send: None,
            ck_recv: None,
            ns: 0,
            nr: 0,
            pn: 0,
            ns_total: 0,
            nr_total: 0,
            my_ratchet_secret: spk_secret.to_bytes(),
            my_ratchet_pub: my_pub.to_bytes(),
            their_ratchet_pub: None,
            skipped: SkippedKeys::default(),
            base,
            pending_send_ratchet: true,
        }
    }

    /// Deep copy used for the commit/rollback discipline.
    pub fn snapshot(&self) -> DrState {
        self.clone()
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    pub fn my_ratchet_pub_b64(&self) -> String {
        B64.encode(self.my_ratchet_pub)
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Advance the sending chain one step and seal `plaintext`.
    ///
    /// Returns the wire header, the base64 ciphertext (GCM tag appended) and
    /// the one-time message key so the caller can vault it for replay.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        my_device_id: &str,
    ) -> Result<(DrHeader, String, [u8; 32]), CryptoError> {
        let ck = self.ck_send.ok_or(CryptoError::SendChainUnavailable)?;
        let (next_ck, mk) = kdf::kdf_ck(&ck)?;
        self.ck_send = Some(next_ck);

        use rand::RngCore;
        let mut iv = [0u8; envelope::IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        self.ns_total += 1;
        let header = DrHeader {
            v: 1,
            device_id: my_device_id.to_string(),
            n: self.ns,
            pn: self.pn,
            counter: self.ns_total,
            ratchet_pub: B64.encode(self.my_ratchet_pub),
            iv_b64: B64.encode(iv),
            meta: None,
        };
        self.ns += 1;

        let ct = envelope::seal(&mk, &iv, header.aad().as_bytes(), plaintext)?;
        Ok((header, B64.encode(&ct), mk))
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Derive the message key for `header` and open the ciphertext.
    ///
    /// Handles skipped keys, in-chain skips and DH ratchet steps. Mutates
    /// the state; callers snapshot first and restore on any error or on
    /// vault-put failure (the counters must not outrun durable key storage).
    pub fn decrypt(
        &mut self,
        header: &DrHeader,
        ciphertext_b64: &str,
    ) -> Result<(Zeroizing<Vec<u8>>, [u8; 32]), CryptoError> {
        let ct = B64.decode(ciphertext_b64)?;
        let iv_raw = B64.decode(&header.iv_b64)?;
        let iv: [u8; envelope::IV_LEN] = iv_raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::EnvelopeMalformed("dr header iv must be 12 bytes".into()))?;
        let their_pub = b64_decode_32(&header.ratchet_pub)?;
        let aad = header.aad();

        // Out-of-order delivery: the key may have been memoized already.
        if let Some(mk) = self.skipped.take(&header.ratchet_pub, header.n) {
            let pt = envelope::open(&mk, &iv, aad.as_bytes(), &ct)?;
            self.nr_total = self.nr_total.max(header.counter);
            return Ok((pt, mk));
        }

        let need_ratchet = match self.their_ratchet_pub {
            Some(current) => current != their_pub,
            None => true,
        };

        if need_ratchet {
            self.ratchet_step(&their_pub, header.pn)?;
        } else if header.n < self.nr {
            // Same chain, already advanced past it, and it was not memoized:
            // the key is gone for good.
            return Err(CryptoError::SkippedMissing {
                chain: header.ratchet_pub.clone(),
                n: header.n,
            });
        }

        self.skip_to(header.n)?;

        let ck = self
            .ck_recv
            .ok_or_else(|| CryptoError::RatchetStep("receiving chain not established".into()))?;
        let (next_ck, mk) = kdf::kdf_ck(&ck)?;
        self.ck_recv = Some(next_ck);

        let pt = envelope::open(&mk, &iv, aad.as_bytes(), &ct)?;
        self.nr += 1;
        self.nr_total = self.nr_total.max(header.counter);
        Ok((pt, mk))
    }

    // ── Internal ─────────────────────────────────────────────────────────

    /// DH ratchet step on receipt of a new ratchet public key.
    fn ratchet_step(&mut self, their_pub: &[u8; 32], prev_chain_len: u64) -> Result<(), CryptoError> {
        // Stash the tail of the old receiving chain before abandoning it.
        if self.their_ratchet_pub.is_some() && self.ck_recv.is_some() {
            self.skip_to(prev_chain_len)?;
        }

        let their = X25519Public::from(*their_pub);

        // Receiving side of the step.
        let my_secret = StaticSecret::from(self.my_ratchet_secret);
        let dh_recv = my_secret.diffie_hellman(&their);
        let (rk, ck_recv) = kdf::kdf_rk(&self.rk, dh_recv.as_bytes())?;
        self.rk = rk;
        self.ck_recv = Some(ck_recv);
        self.nr = 0;
        self.their_ratchet_pub = Some(*their_pub);

        // Sending side: fresh ratchet keypair.
        self.pn = self.ns;
        self.ns = 0;
        let new_secret = StaticSecret::random_from_rng(OsRng);
        self.my_ratchet_pub = X25519Public::from(&new_secret).to_bytes();
        let dh_send = new_secret.diffie_hellman(&their);
        let (rk, ck_send) = kdf::kdf_rk(&self.rk, dh_send.as_bytes())?;
        self.rk = rk;
        self.ck_send = Some(ck_send);
        self.my_ratchet_secret = new_secret.to_bytes();
        self.pending_send_ratchet = false;

        Ok(())
    }

    /// Derive and memoize receive-chain keys from `nr` up to (excluding)
    /// `until`.
    fn skip_to(&mut self, until: u64) -> Result<(), CryptoError> {
        if until <= self.nr {
            return Ok(());
        }
        let jump = until - self.nr;
        if jump > MAX_SKIP_PER_CHAIN as u64 {
            return Err(CryptoError::TooManySkipped {
                requested: jump,
                cap: MAX_SKIP_PER_CHAIN as u64,
            });
        }

        let chain = self
            .their_ratchet_pub
            .map(|k| B64.encode(k))
            .unwrap_or_default();

        let Some(mut ck) = self.ck_recv else {
            return Err(CryptoError::RatchetStep(
                "cannot skip on an unestablished receiving chain".into(),
            ));
        };
        while self.nr < until {
            let (next_ck, mk) = kdf::kdf_ck(&ck)?;
            ck = next_ck;
            self.skipped.insert(chain.clone(), self.nr, mk);
            self.nr += 1;
        }
        self.ck_recv = Some(ck);
        Ok(())
    }
}

// ── Serde helpers (keys rendered base64 in snapshots) ────────────────────────

mod b64_key {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(de)?;
        let bytes = STANDARD.decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod b64_key_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &Option<[u8; 32]>, ser: S) -> Result<S::Ok, S::Error> {
        match key {
            Some(k) => ser.serialize_some(&STANDARD.encode(k)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<[u8; 32]>, D::Error> {
        let opt: Option<String> = Option::deserialize(de)?;
        match opt {
            None => Ok(None),
            Some(s) => {
                let bytes = STANDARD.decode(&s).map_err(serde::de::Error::custom)?;
                let arr = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceKeyBundle;
    use crate::x3dh;

    fn base(role: Role) -> SessionBaseKey {
        SessionBaseKey {
            conversation_id: "conv-1".into(),
            peer_account_digest: AccountDigest::parse(
                "00112233445566778899AABBCCDDEEFF00112233445566778899AABBCCDDEEFF",
            )
            .unwrap(),
            peer_device_id: "peer-dev".into(),
            role,
            conversation_token_b64: B64.encode([0u8; 32]),
        }
    }

    /// Handshake a fresh pair of sessions through X3DH.
    fn session_pair() -> (DrState, DrState) {
        let alice_dev = DeviceKeyBundle::generate(0);
        let bob_dev = DeviceKeyBundle::generate(0);

        let bundle = x3dh::PrekeyBundle {
            ik_pub: bob_dev.ik_public_b64(),
            spk_pub: bob_dev.spk_public_b64(),
            spk_sig: bob_dev.spk_sig_b64(),
            opk_pub: None,
            opk_id: None,
        };
        let init = x3dh::initiate(&alice_dev.identity(), &bundle).unwrap();
        let sk_bob = x3dh::respond(
            &bob_dev.identity(),
            &bob_dev.spk_secret(),
            None,
            alice_dev.identity().public_bytes(),
            &init.dr_init,
        )
        .unwrap();

        let alice = DrState::new_initiator(
            init.shared_key,
            init.ek_secret,
            &bob_dev.spk_public(),
            base(Role::Initiator),
        )
        .unwrap();
        let bob = DrState::new_responder(sk_bob, bob_dev.spk_secret(), base(Role::Responder));
        (alice, bob)
    }

    #[test]
    fn full_conversation_roundtrip() {
        let (mut alice, mut bob) = session_pair();

        for i in 0..3u8 {
            let msg = format!("message {i}");
            let (h, ct, _mk) = alice.encrypt(msg.as_bytes(), "alice-dev").unwrap();
            let (pt, _) = bob.decrypt(&h, &ct).unwrap();
            assert_eq!(&*pt, msg.as_bytes());
        }
        assert_eq!(bob.nr, 3);
        assert_eq!(bob.nr_total, 3);

        // Bob replies — this is his first send, unlocked by the DH ratchet
        // his first receive performed.
        let (h, ct, _) = bob.encrypt(b"reply", "bob-dev").unwrap();
        let (pt, _) = alice.decrypt(&h, &ct).unwrap();
        assert_eq!(&*pt, b"reply");

        // Alice again — a full DH ratchet round-trip.
        let (h, ct, _) = alice.encrypt(b"again", "alice-dev").unwrap();
        let (pt, _) = bob.decrypt(&h, &ct).unwrap();
        assert_eq!(&*pt, b"again");
    }

    #[test]
    fn responder_cannot_send_before_first_receive() {
        let (_, mut bob) = session_pair();
        assert!(matches!(
            bob.encrypt(b"too early", "bob-dev"),
            Err(CryptoError::SendChainUnavailable)
        ));
    }

    #[test]
    fn out_of_order_triple_drains_skipped_keys() {
        let (mut alice, mut bob) = session_pair();

        let m: Vec<_> = (0..4)
            .map(|i| {
                let (h, ct, _) = alice.encrypt(format!("m{i}").as_bytes(), "alice-dev").unwrap();
                (h, ct)
            })
            .collect();

        // Arrival order 0, 2, 1, 3
        for idx in [0usize, 2, 1, 3] {
            let (h, ct) = &m[idx];
            let (pt, _) = bob.decrypt(h, ct).unwrap();
            assert_eq!(&*pt, format!("m{idx}").as_bytes());
        }
        assert_eq!(bob.nr, 4);
        assert_eq!(bob.skipped_len(), 0);
        assert_eq!(bob.nr_total, 4);
    }

    #[test]
    fn skipped_replay_3_1_2() {
        let (mut alice, mut bob) = session_pair();
        let msgs: Vec<_> = (0..3)
            .map(|i| {
                let (h, ct, _) = alice.encrypt(format!("p{i}").as_bytes(), "alice-dev").unwrap();
                (h, ct)
            })
            .collect();

        for idx in [2usize, 0, 1] {
            let (h, ct) = &msgs[idx];
            let (pt, _) = bob.decrypt(h, ct).unwrap();
            assert_eq!(&*pt, format!("p{idx}").as_bytes());
        }
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn ratchet_step_stashes_previous_chain_tail() {
        let (mut alice, mut bob) = session_pair();

        // Establish both directions.
        let (h, ct, _) = alice.encrypt(b"a0", "alice-dev").unwrap();
        bob.decrypt(&h, &ct).unwrap();
        let (h, ct, _) = bob.encrypt(b"b0", "bob-dev").unwrap();
        alice.decrypt(&h, &ct).unwrap();

        // Bob sends three more on his current chain; they get lost in flight.
        let _lost1 = bob.encrypt(b"lost1", "bob-dev").unwrap();
        let _lost2 = bob.encrypt(b"lost2", "bob-dev").unwrap();
        let _lost3 = bob.encrypt(b"lost3", "bob-dev").unwrap();

        // Alice sends, forcing Bob onto a new chain; Bob's next message
        // carries pn=4 and n=0 on the fresh chain.
        let (h, ct, _) = alice.encrypt(b"a1", "alice-dev").unwrap();
        bob.decrypt(&h, &ct).unwrap();
        let (h_new, ct_new, _) = bob.encrypt(b"b-new-chain", "bob-dev").unwrap();
        assert_eq!(h_new.pn, 4);
        assert_eq!(h_new.n, 0);

        let before = alice.skipped_len();
        let (pt, _) = alice.decrypt(&h_new, &ct_new).unwrap();
        assert_eq!(&*pt, b"b-new-chain");
        // Three unread keys of the old chain were memoized during the step.
        assert_eq!(alice.skipped_len(), before + 3);
        assert_eq!(alice.nr, 1);
    }

    #[test]
    fn tampered_aad_is_integrity_failure() {
        let (mut alice, mut bob) = session_pair();
        let (mut h, ct, _) = alice.encrypt(b"secret", "alice-dev").unwrap();
        h.counter += 1; // replay-binding: counter feeds the AAD
        assert!(matches!(
            bob.decrypt(&h, &ct),
            Err(CryptoError::IntegrityFailure)
        ));
    }

    #[test]
    fn stale_counter_without_memoized_key_is_skipped_missing() {
        let (mut alice, mut bob) = session_pair();
        let (h0, ct0, _) = alice.encrypt(b"one", "alice-dev").unwrap();
        bob.decrypt(&h0, &ct0).unwrap();
        // Replaying the same in-order header: its key was consumed, never
        // memoized.
        assert!(matches!(
            bob.decrypt(&h0, &ct0),
            Err(CryptoError::SkippedMissing { .. })
        ));
    }

    #[test]
    fn snapshot_rollback_rewinds_counters() {
        let (mut alice, mut bob) = session_pair();
        let (h, ct, _) = alice.encrypt(b"m", "alice-dev").unwrap();

        let snap = bob.snapshot();
        bob.decrypt(&h, &ct).unwrap();
        assert_eq!(bob.nr_total, 1);

        bob = snap; // vault put failed: roll back
        assert_eq!(bob.nr_total, 0);
        let (pt, _) = bob.decrypt(&h, &ct).unwrap();
        assert_eq!(&*pt, b"m");
    }

    #[test]
    fn counter_jump_beyond_cap_is_rejected() {
        let (mut alice, mut bob) = session_pair();
        let mut last = None;
        // Advance alice far past the skip cap without delivering.
        for _ in 0..(MAX_SKIP_PER_CHAIN as u64 + 2) {
            last = Some(alice.encrypt(b"x", "alice-dev").unwrap());
        }
        let (h, ct, _) = last.unwrap();
        assert!(matches!(
            bob.decrypt(&h, &ct),
            Err(CryptoError::TooManySkipped { .. })
        ));
    }

    #[test]
    fn skipped_table_per_chain_cap_evicts_oldest_of_that_chain() {
        let mut table = SkippedKeys::default();
        for n in 0..(MAX_SKIP_PER_CHAIN as u64 + 5) {
            table.insert("chain-a".into(), n, [1u8; 32]);
        }
        assert_eq!(table.len(), MAX_SKIP_PER_CHAIN);
        assert!(table.take("chain-a", 0).is_none());
        assert!(table.take("chain-a", 5).is_some());
    }

    #[test]
    fn skipped_table_total_cap_evicts_globally_oldest() {
        let mut table = SkippedKeys::default();
        for n in 0..MAX_SKIP_PER_CHAIN as u64 {
            table.insert("chain-a".into(), n, [1u8; 32]);
        }
        for n in 0..MAX_SKIP_PER_CHAIN as u64 {
            table.insert("chain-b".into(), n, [2u8; 32]);
        }
        assert_eq!(table.len(), MAX_SKIP_TOTAL);
        // One more entry on a third chain trips the total cap: the oldest
        // entry overall (chain-a, 0) goes.
        table.insert("chain-c".into(), 0, [3u8; 32]);
        assert_eq!(table.len(), MAX_SKIP_TOTAL);
        assert!(table.take("chain-a", 0).is_none());
        assert!(table.take("chain-b", 0).is_some());
        assert!(table.take("chain-c", 0).is_some());
    }

    #[test]
    fn state_snapshot_serialises_keys_as_base64() {
        let (alice, _) = session_pair();
        let json = serde_json::to_value(&alice).unwrap();
        let rk = json["rk"].as_str().expect("rk is a base64 string");
        assert_eq!(B64.decode(rk).unwrap().len(), 32);
        let back: DrState = serde_json::from_value(json).unwrap();
        assert_eq!(back.ns_total, alice.ns_total);
        assert_eq!(back.base.conversation_id, "conv-1");
    }
}
