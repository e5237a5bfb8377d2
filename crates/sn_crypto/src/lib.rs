//! sn_crypto — Sentinel Messenger cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Opaque newtypes (`AccountDigest`, `PeerKey`) at every identity boundary.
//!
//! # Module layout
//! - `identity` — account digests, peer keys, Ed25519 identity + device key bundles
//! - `x3dh`     — X3DH-style key agreement (SPK verification, DH1..DH4, `dr_init`)
//! - `ratchet`  — Double Ratchet with DH steps, dual counters, skipped-key table
//! - `envelope` — strict AES-256-GCM JSON envelope + raw AEAD for DR messages
//! - `kdf`      — HKDF-SHA256 / ratchet KDFs / Master Key derivation
//! - `error`    — unified error type

pub mod envelope;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
