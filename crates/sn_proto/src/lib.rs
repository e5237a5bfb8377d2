//! sn_proto — Sentinel Messenger protocol types
//!
//! Wire-facing request/response bodies, packet classification and the
//! contact-share side-channel payloads. The server side of these types only
//! ever sees routing fields and sealed blobs.

pub mod api;
pub mod contact;
pub mod error;
pub mod packet;

pub use error::ProtoError;
