use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Master key locked — unlock the session first")]
    Locked,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] sn_crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Proto(#[from] sn_proto::ProtoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("No session state for peer {0}")]
    SessionMissing(String),

    #[error("Vault re-put for {message_id} carries different key bytes")]
    VaultConflict { message_id: String },

    #[error("Vault write failed: {0}")]
    VaultPut(String),

    #[error("Vault entry context does not match the requested slot")]
    VaultContextMismatch,

    #[error("Network unavailable: {0}")]
    Network(String),

    #[error("Transport rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl StoreError {
    pub fn is_network(&self) -> bool {
        matches!(self, StoreError::Network(_))
    }
}
