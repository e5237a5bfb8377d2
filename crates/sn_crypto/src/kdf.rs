//! Key derivation functions
//!
//! `hkdf_expand` — HKDF-SHA256, the single extract-and-expand entry point.
//! `kdf_rk` / `kdf_ck` — the two Double Ratchet derivations (root step and
//! symmetric chain step, HMAC constants per the Signal spec).
//! `derive_master_key` — mixes the one-shot credential exchange secret with
//! the account token into the 32-byte Master Key.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
/// `salt` may be `None` (HKDF substitutes a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// KDF_RK: mix a DH output into the root key.
/// Returns (new_root_key, new_chain_key).
pub fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(rk), dh_output);
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    hk.expand(b"ratchet-rk/v1", &mut new_rk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"ratchet-ck/v1", &mut ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_rk, ck))
}

/// KDF_CK: chain key → (next_chain_key, message_key).
pub fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut mac_ck = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x01]); // chain key constant
    let new_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x02]); // message key constant
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((new_ck, mk))
}

/// Derive the Master Key from the credential exchange secret and the account
/// token. Process-memory only; the caller is responsible for zeroizing.
pub fn derive_master_key(
    exchange_secret: &[u8],
    account_token: &str,
) -> Result<[u8; 32], CryptoError> {
    let mut mk = [0u8; 32];
    hkdf_expand(
        exchange_secret,
        Some(account_token.as_bytes()),
        b"mk/v1",
        &mut mk,
    )?;
    Ok(mk)
}
