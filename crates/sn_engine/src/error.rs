//! Engine error model.
//!
//! Every failure that crosses the engine boundary carries one of the
//! enumerated kinds plus whatever peer/counter context the coordinator had.
//! The pipeline never throws past a per-peer boundary: a failed packet turns
//! into an `ErrorRecord` kept beside decrypted items.

use std::fmt;

use thiserror::Error;

use sn_crypto::CryptoError;
use sn_store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// MK / account token / device id not present. Non-retryable for this
    /// session; callers prompt a re-unlock.
    IdentityMissing,
    /// DR session not yet ready (contact secret missing). Recoverable.
    SecurePending,
    /// DR state missing or corrupt. Recoverable after re-hydrate.
    DrStateUnavailable,
    /// Out-of-order message whose key has been evicted. Fails this packet
    /// only.
    SkippedMissing,
    /// AEAD tag mismatch — tamper/replay. Fatal for this packet.
    IntegrityFailure,
    /// Vault write failed; DR advance was rolled back.
    VaultPutFailed,
    /// Server rejected a send because our counter lags.
    CounterTooLow,
    /// Transport failure. Retried without consuming the retry budget.
    NetworkUnavailable,
    /// Restore pipeline halted at this stage.
    RestoreStageFail(u8),
    /// Gap job exhausted its retry budget.
    GapQueueFail,
    Internal,
}

impl ErrorKind {
    /// Kinds the live coordinator retries with backoff.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::SecurePending | ErrorKind::DrStateUnavailable | ErrorKind::VaultPutFailed
        )
    }

    pub fn as_code(&self) -> String {
        match self {
            ErrorKind::IdentityMissing => "IDENTITY_MISSING".into(),
            ErrorKind::SecurePending => "SECURE_PENDING".into(),
            ErrorKind::DrStateUnavailable => "DR_STATE_UNAVAILABLE".into(),
            ErrorKind::SkippedMissing => "SKIPPED_MISSING".into(),
            ErrorKind::IntegrityFailure => "INTEGRITY".into(),
            ErrorKind::VaultPutFailed => "VAULT_PUT_FAILED".into(),
            ErrorKind::CounterTooLow => "COUNTER_TOO_LOW".into(),
            ErrorKind::NetworkUnavailable => "NETWORK_UNAVAILABLE".into(),
            ErrorKind::RestoreStageFail(n) => format!("RESTORE_STAGE_FAIL_{n}"),
            ErrorKind::GapQueueFail => "GAP_QUEUE_FAIL".into(),
            ErrorKind::Internal => "INTERNAL".into(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_code())
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}{}", context_suffix(.peer, .counter))]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub peer: Option<String>,
    pub counter: Option<u64>,
}

fn context_suffix(peer: &Option<String>, counter: &Option<u64>) -> String {
    match (peer, counter) {
        (Some(p), Some(c)) => format!(" (peer {p}, counter {c})"),
        (Some(p), None) => format!(" (peer {p})"),
        (None, Some(c)) => format!(" (counter {c})"),
        (None, None) => String::new(),
    }
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            peer: None,
            counter: None,
        }
    }

    pub fn with_peer(mut self, peer: impl ToString) -> Self {
        self.peer = Some(peer.to_string());
        self
    }

    pub fn with_counter(mut self, counter: u64) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn identity_missing(what: &str) -> Self {
        Self::new(ErrorKind::IdentityMissing, format!("{what} not available"))
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkUnavailable, message)
    }
}

impl From<CryptoError> for EngineError {
    fn from(e: CryptoError) -> Self {
        let kind = match &e {
            CryptoError::IntegrityFailure => ErrorKind::IntegrityFailure,
            CryptoError::SkippedMissing { .. } => ErrorKind::SkippedMissing,
            CryptoError::SendChainUnavailable => ErrorKind::SecurePending,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::Locked => ErrorKind::IdentityMissing,
            StoreError::Network(_) => ErrorKind::NetworkUnavailable,
            StoreError::VaultConflict { .. } => ErrorKind::IntegrityFailure,
            StoreError::VaultContextMismatch => ErrorKind::IntegrityFailure,
            StoreError::VaultPut(_) => ErrorKind::VaultPutFailed,
            StoreError::SessionMissing(_) => ErrorKind::DrStateUnavailable,
            StoreError::Crypto(c) => {
                return EngineError::from(match c {
                    CryptoError::IntegrityFailure => CryptoError::IntegrityFailure,
                    CryptoError::SkippedMissing { chain, n } => CryptoError::SkippedMissing {
                        chain: chain.clone(),
                        n: *n,
                    },
                    _ => return Self::new(ErrorKind::Internal, e.to_string()),
                })
            }
            _ => ErrorKind::Internal,
        };
        Self::new(kind, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(ErrorKind::SecurePending.is_recoverable());
        assert!(ErrorKind::VaultPutFailed.is_recoverable());
        assert!(ErrorKind::DrStateUnavailable.is_recoverable());
        assert!(!ErrorKind::IntegrityFailure.is_recoverable());
        assert!(!ErrorKind::SkippedMissing.is_recoverable());
        assert!(!ErrorKind::IdentityMissing.is_recoverable());
    }

    #[test]
    fn context_renders_in_message() {
        let err = EngineError::new(ErrorKind::VaultPutFailed, "put rejected")
            .with_peer("DIGEST::dev-1")
            .with_counter(42);
        let text = err.to_string();
        assert!(text.contains("VAULT_PUT_FAILED"));
        assert!(text.contains("DIGEST::dev-1"));
        assert!(text.contains("42"));
    }

    #[test]
    fn store_errors_map_to_kinds() {
        let e: EngineError = StoreError::Locked.into();
        assert_eq!(e.kind, ErrorKind::IdentityMissing);
        let e: EngineError = StoreError::Network("timeout".into()).into();
        assert_eq!(e.kind, ErrorKind::NetworkUnavailable);
        let e: EngineError = StoreError::VaultConflict {
            message_id: "m".into(),
        }
        .into();
        assert_eq!(e.kind, ErrorKind::IntegrityFailure);
    }
}
