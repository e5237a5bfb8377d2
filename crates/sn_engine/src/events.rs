//! Engine event bus.
//!
//! Downstream consumers (timeline sink, UI adapters) subscribe to a
//! broadcast channel. Events are fire-and-forget: a lagging subscriber
//! loses oldest events, never blocks the pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use sn_crypto::identity::PeerKey;
use sn_proto::packet::{Direction, PacketKind};

use crate::error::ErrorKind;

const EVENT_CAPACITY: usize = 256;

/// One successfully decrypted message, ready for the timeline.
#[derive(Debug, Clone)]
pub struct DecryptedMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub peer: PeerKey,
    pub counter: u64,
    pub direction: Direction,
    pub kind: PacketKind,
    pub msg_type: Option<String>,
    pub plaintext: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// A packet that failed; rendered as a placeholder instead of a message.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub peer: Option<String>,
    pub counter: Option<u64>,
    pub code: String,
    pub detail: String,
}

impl ErrorRecord {
    pub fn new(
        message_id: impl Into<String>,
        conversation_id: impl Into<String>,
        kind: ErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
            peer: None,
            counter: None,
            code: kind.as_code(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessageDecrypted(DecryptedMessage),
    PacketFailed(ErrorRecord),
    ContactsChanged,
    ContactEntryUpdated { peer: PeerKey },
    OfflineUnread { conversation_id: String, count: u64 },
    RestoreStage { stage: u8, ok: bool, reason_code: String },
    GapJobFinished { conversation_id: String, target_counter: u64, ok: bool },
}

/// Cloneable handle over the broadcast pair.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish, ignoring the no-subscriber case.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
