//! sn_store — Sentinel Messenger key stores and encrypted local cache
//!
//! # Layering
//! Everything here sits between the crypto primitives and the delivery
//! engine: it owns state, never control flow. The live coordinator's
//! per-peer lock is what serializes mutations of DR sessions; this crate
//! only enforces the shapes (one state per peer, bounded traces, idempotent
//! vault slots).
//!
//! # Module layout
//! - `keyring`  — Master Key + account identity + device key bundle, in memory
//! - `sessions` — `PeerKey → DrState` map, snapshots, hydrate, trace ring
//! - `vault`    — server-backed message-key vault client (MK-wrapped entries)
//! - `contacts` — contact secrets, pending invites, wrapped import/export
//! - `db`       — SQLite cache for the few opt-in persisted items
//! - `error`    — unified error type

pub mod contacts;
pub mod db;
pub mod error;
pub mod keyring;
pub mod sessions;
pub mod vault;

pub use db::LocalCache;
pub use error::StoreError;
pub use keyring::Keyring;
pub use sessions::SessionStore;
pub use vault::MessageKeyVault;
