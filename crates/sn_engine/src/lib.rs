//! sn_engine — Sentinel Messenger delivery engine
//!
//! # Layering
//! Crypto primitives (`sn_crypto`) and state stores (`sn_store`) sit below;
//! this crate owns control flow: the live coordinator (Route B), the bulk
//! replay fetcher (Route A), gap recovery, the staged restore pipeline and
//! the contact-share flow. The server is reached only through transport
//! traits, so every pipeline runs unchanged against in-memory fakes.
//!
//! # Module layout
//! - `session`       — the consolidated `Session` value + engine tunables
//! - `coordinator`   — per-peer single-writer decrypt/commit discipline
//! - `pipeline`      — live ingest orchestration
//! - `replay`        — hybrid history fetcher (vault keys first)
//! - `fetch_lock`    — per-conversation replay/live arbitration
//! - `gaps`          — max-counter probe + per-conversation gap queue
//! - `restore`       — staged bring-up on unlock
//! - `contact_share` — invite/session-bootstrap side-channel
//! - `bootstrap`     — credential exchange, MK derivation, device keys
//! - `client`        — reqwest transport
//! - `events`        — broadcast bus for downstream consumers
//! - `error`         — engine error kinds

pub mod bootstrap;
pub mod client;
pub mod contact_share;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fetch_lock;
pub mod gaps;
pub mod pipeline;
pub mod replay;
pub mod restore;
pub mod session;
pub mod transport;

pub use coordinator::LiveCoordinator;
pub use error::{EngineError, ErrorKind};
pub use events::{DecryptedMessage, EngineEvent};
pub use session::{EngineConfig, Session};
