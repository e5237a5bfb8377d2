use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD authentication failed (tag mismatch — possible tampering or replay)")]
    IntegrityFailure,

    #[error("Malformed envelope: {0}")]
    EnvelopeMalformed(String),

    #[error("Info tag {0:?} is not in the caller allow-list")]
    InfoNotAllowed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid account digest: {0}")]
    InvalidDigest(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Sending chain not established")]
    SendChainUnavailable,

    #[error("Skipped message key missing for chain {chain} n={n}")]
    SkippedMissing { chain: String, n: u64 },

    #[error("Counter jump of {requested} exceeds skip cap {cap}")]
    TooManySkipped { requested: u64, cap: u64 },

    #[error("Ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

impl CryptoError {
    /// True for failures that no amount of retrying will fix (tampered or
    /// unrecoverable ciphertext). The coordinator refuses to retry these.
    pub fn is_fatal_for_packet(&self) -> bool {
        matches!(
            self,
            CryptoError::IntegrityFailure | CryptoError::SkippedMissing { .. }
        )
    }
}
