use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Packet has no Double Ratchet header")]
    MissingDrHeader,

    #[error("Packet has no resolvable counter")]
    MissingCounter,

    #[error("Packet has no sender device id")]
    MissingSenderDevice,

    #[error("Fallback packets are not accepted by the secure pipeline")]
    FallbackRejected,

    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] sn_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
