//! Restore pipeline — staged bring-up after unlock.
//!
//! Six stages, each reported with ok/reasonCode. A failing stage halts the
//! pipeline; later stages report `STAGE_SKIPPED`.
//!
//!   0. credentials present (MK, account token, device id)
//!   1. locally-cached contact secrets into memory
//!   2. remote wrapped backup merged in
//!   3. DR state hydrated for every contact secret
//!   4. gap detection per conversation (lazy mode: record an offline unread
//!      count instead of decrypting eagerly)
//!   5. terminal marker

use std::sync::Arc;

use serde::Serialize;

use crate::{
    coordinator::LiveCoordinator,
    error::{EngineError, ErrorKind},
    events::EngineEvent,
    gaps::GapQueue,
    session::Session,
};

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: u8,
    pub ok: bool,
    pub reason_code: String,
}

#[derive(Debug, Default, Serialize)]
pub struct RestoreReport {
    pub stages: Vec<StageReport>,
}

impl RestoreReport {
    pub fn ok(&self) -> bool {
        self.stages.iter().all(|s| s.ok)
    }

    fn push(&mut self, session: &Session, stage: u8, ok: bool, reason_code: impl Into<String>) {
        let reason_code = reason_code.into();
        tracing::info!(
            target: "sn_engine",
            event = "restore_stage",
            stage,
            ok,
            reason_code = %reason_code
        );
        session.events.emit(EngineEvent::RestoreStage {
            stage,
            ok,
            reason_code: reason_code.clone(),
        });
        self.stages.push(StageReport {
            stage,
            ok,
            reason_code,
        });
    }

    fn skip_remaining(&mut self, session: &Session, from: u8) {
        for stage in from..=5 {
            self.push(session, stage, false, "STAGE_SKIPPED");
        }
    }
}

/// Run the full pipeline once per unlock.
pub async fn run(
    session: &Arc<Session>,
    coordinator: &Arc<LiveCoordinator>,
    gaps: &Arc<GapQueue>,
) -> RestoreReport {
    let mut report = RestoreReport::default();

    // ── Stage 0: credentials ─────────────────────────────────────────────
    if session.keyring.is_locked().await {
        report.push(session, 0, false, ErrorKind::IdentityMissing.as_code());
        report.skip_remaining(session, 1);
        return report;
    }
    report.push(session, 0, true, "ok");

    // ── Stage 1: local contact secrets ───────────────────────────────────
    match load_local_secrets(session).await {
        Ok(n) => report.push(session, 1, true, format!("loaded={n}")),
        Err(reason) => {
            report.push(session, 1, false, reason);
            report.skip_remaining(session, 2);
            return report;
        }
    }

    // ── Stage 2: remote wrapped backup ───────────────────────────────────
    match merge_remote_backup(session).await {
        Ok(n) => report.push(session, 2, true, format!("merged={n}")),
        Err(reason) => {
            report.push(session, 2, false, reason);
            report.skip_remaining(session, 3);
            return report;
        }
    }

    // ── Stage 3: DR hydrate ──────────────────────────────────────────────
    let mut hydrated = 0usize;
    let mut failed = 0usize;
    for secret in session.contacts.all().await {
        let peer = secret.peer_key();
        if session.sessions.contains(&peer).await {
            hydrated += 1;
            continue;
        }
        if secret.dr_init.is_none() {
            // Nothing to bootstrap from; the session will arrive with the
            // peer's first live packet or a fresh handshake.
            continue;
        }
        match coordinator.ensure_session(&peer).await {
            Ok(()) => hydrated += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(
                    target: "sn_engine",
                    event = "restore_hydrate_failed",
                    peer = %peer,
                    error = %e
                );
            }
        }
    }
    report.push(
        session,
        3,
        true,
        format!("hydrated={hydrated} failed={failed}"),
    );

    // ── Stage 4: gap detection / drain ───────────────────────────────────
    match stage_gaps(session, gaps).await {
        Ok(summary) => report.push(session, 4, true, summary),
        Err(reason) => {
            report.push(session, 4, false, reason);
            report.skip_remaining(session, 5);
            return report;
        }
    }

    // ── Stage 5: terminal ────────────────────────────────────────────────
    report.push(session, 5, true, "done");
    report
}

async fn load_local_secrets(session: &Arc<Session>) -> Result<usize, String> {
    let Some(cache) = &session.cache else {
        return Ok(0);
    };
    let digest = session
        .keyring
        .account_digest()
        .await
        .map_err(|e| EngineError::from(e).kind.as_code())?;
    let master_key = session
        .keyring
        .mk()
        .await
        .map_err(|e| EngineError::from(e).kind.as_code())?;

    let blob = cache
        .load_contact_blob(digest.as_str())
        .await
        .map_err(|e| format!("CACHE_READ: {e}"))?;
    match blob {
        Some(env) => session
            .contacts
            .import_wrapped(&env, &master_key)
            .await
            .map_err(|e| format!("BLOB_UNWRAP: {e}")),
        None => Ok(0),
    }
}

async fn merge_remote_backup(session: &Arc<Session>) -> Result<usize, String> {
    let master_key = session
        .keyring
        .mk()
        .await
        .map_err(|e| EngineError::from(e).kind.as_code())?;
    let downlink = session
        .api
        .contacts_downlink()
        .await
        .map_err(|e| e.kind.as_code())?;
    match downlink.encrypted_blob {
        Some(env) => session
            .contacts
            .import_wrapped(&env, &master_key)
            .await
            .map_err(|e| format!("BLOB_UNWRAP: {e}")),
        None => Ok(0),
    }
}

async fn stage_gaps(session: &Arc<Session>, gaps: &Arc<GapQueue>) -> Result<String, String> {
    let mut enqueued = 0usize;
    let mut lazy_skipped = 0usize;

    for secret in session.contacts.all().await {
        let conv = &secret.conversation_id;
        let sender = &secret.peer_device_id;

        let server_max = match session
            .api
            .max_counter(sn_proto::api::MaxCounterQuery {
                conversation_id: conv.clone(),
                sender_device_id: sender.clone(),
            })
            .await
        {
            Ok(r) => r.max_counter,
            Err(e) => return Err(e.kind.as_code()),
        };
        let local = gaps
            .local_processed(conv, sender)
            .await
            .map_err(|e| e.kind.as_code())?;
        if server_max <= local {
            continue;
        }

        if session.config.lazy_restore {
            // The newest key is not in the vault — surface the unread count
            // and leave decryption for when the thread is opened.
            let vaulted = session
                .vault
                .latest_counters(conv, sender)
                .await
                .map_err(|e| EngineError::from(e).kind.as_code())?
                .incoming;
            if vaulted < server_max {
                lazy_skipped += 1;
                session.events.emit(EngineEvent::OfflineUnread {
                    conversation_id: conv.clone(),
                    count: server_max - local,
                });
                continue;
            }
        }

        gaps.enqueue(crate::gaps::GapJob {
            conversation_id: conv.clone(),
            sender_device_id: sender.clone(),
            target_counter: server_max,
        })
        .await;
        enqueued += 1;
    }

    if enqueued > 0 {
        gaps.drain_all().await;
    }
    Ok(format!("enqueued={enqueued} lazy_skipped={lazy_skipped}"))
}
