//! Live ingest orchestrator.
//!
//! Raw packets from the transport are classified and ordered by the proto
//! layer, then fed through the live coordinator one at a time in
//! `(sender_device, counter)` order, holding each conversation's
//! secure-fetch lock as `live` (which preempts any replay fetcher on the
//! same conversation). Failures never cross a per-peer boundary — each
//! failed packet becomes an `ErrorRecord` kept beside the decrypted items
//! so the UI can render a placeholder in its slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use sn_proto::api::RawPacket;
use sn_proto::packet::{self, Direction, PacketKind, ReplayItem};

use crate::{
    coordinator::LiveCoordinator,
    error::ErrorKind,
    events::{DecryptedMessage, EngineEvent, ErrorRecord},
    fetch_lock::FetchOwner,
    session::Session,
};

#[derive(Default)]
pub struct PipelineOutcome {
    pub decrypted: Vec<DecryptedMessage>,
    pub errors: Vec<ErrorRecord>,
}

/// Ingest one batch of live packets.
pub async fn ingest_live(
    session: &Arc<Session>,
    coordinator: &Arc<LiveCoordinator>,
    raws: &[RawPacket],
) -> Result<PipelineOutcome, crate::error::EngineError> {
    let me = session.self_identity().await?;
    let (items, dropped) = packet::resolve_batch(raws, &me);

    let mut outcome = PipelineOutcome::default();
    for d in dropped {
        let record = ErrorRecord::new(
            d.message_id,
            d.conversation_id,
            ErrorKind::Internal,
            d.reason,
        );
        session
            .events
            .emit(EngineEvent::PacketFailed(record.clone()));
        outcome.errors.push(record);
    }

    // Per-conversation, preserving the (sender, counter) order inside.
    let mut by_conversation: BTreeMap<String, Vec<ReplayItem>> = BTreeMap::new();
    for item in items {
        by_conversation
            .entry(item.conversation_id.clone())
            .or_default()
            .push(item);
    }

    for (conversation_id, conv_items) in by_conversation {
        let _guard = session
            .fetch_locks
            .acquire(&conversation_id, FetchOwner::Live)
            .await;

        for item in conv_items {
            match coordinator.process_with_retry(&item).await {
                Ok(msg) => {
                    maybe_send_receipt(session, coordinator, &msg).await;
                    outcome.decrypted.push(msg);
                }
                Err(e) => {
                    let mut record = ErrorRecord::new(
                        item.message_id.clone(),
                        item.conversation_id.clone(),
                        e.kind,
                        e.to_string(),
                    );
                    record.peer = item.peer_key().map(|p| p.to_string());
                    record.counter = Some(item.counter);
                    session
                        .events
                        .emit(EngineEvent::PacketFailed(record.clone()));
                    outcome.errors.push(record);
                }
            }
        }
    }
    Ok(outcome)
}

/// Delivery receipt for a committed incoming user message, when enabled.
/// Best-effort: a failed receipt never fails the ingest.
async fn maybe_send_receipt(
    session: &Arc<Session>,
    coordinator: &Arc<LiveCoordinator>,
    msg: &DecryptedMessage,
) {
    if !session.config.delivery_receipts
        || msg.direction != Direction::Incoming
        || msg.kind != PacketKind::UserMessage
    {
        return;
    }
    let receipt = serde_json::json!({ "receipt_for": msg.message_id, "state": "delivered" });
    if let Err(e) = coordinator
        .send_user_message(
            &msg.peer,
            receipt.to_string().as_bytes(),
            Some("control/receipt".into()),
        )
        .await
    {
        tracing::debug!(
            target: "sn_engine",
            event = "receipt_send_failed",
            message_id = %msg.message_id,
            error = %e
        );
    }
}
