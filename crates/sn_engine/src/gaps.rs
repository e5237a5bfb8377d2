//! Gap queue & max-counter probe.
//!
//! Whenever the server's max counter for a peer's chain runs ahead of what
//! we have durably processed, a counter-targeted job is enqueued. Jobs for
//! one conversation drain serially in target order; conversations drain in
//! parallel.
//!
//! The local-processed counter is sourced in authority order:
//!   1. vault `latest_state` (keys durably stored),
//!   2. DR `nr_total`,
//!   3. zero.
//! This keeps the invariant that we only claim a counter once the vault
//! holds its key.
//!
//! Retry shape: server-side failures consume the bounded retry budget
//! (`GAP_QUEUE_RETRY_MAX`); pure network failures wait without consuming it,
//! capped by a wall-clock offline allowance. Every scheduled sleep is capped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use sn_proto::api::{ByCounterQuery, MaxCounterQuery, RawPacket};
use sn_proto::packet::{self, ReplayItem};

use crate::{
    coordinator::LiveCoordinator,
    error::{EngineError, ErrorKind},
    events::{EngineEvent, ErrorRecord},
    session::Session,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapJob {
    pub conversation_id: String,
    pub sender_device_id: String,
    pub target_counter: u64,
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub processed: u64,
    pub failed_packets: Vec<ErrorRecord>,
    pub aborted: bool,
}

pub struct GapQueue {
    session: Arc<Session>,
    coordinator: Arc<LiveCoordinator>,
    queues: Mutex<HashMap<String, VecDeque<GapJob>>>,
}

impl GapQueue {
    pub fn new(session: Arc<Session>, coordinator: Arc<LiveCoordinator>) -> Self {
        Self {
            session,
            coordinator,
            queues: Mutex::new(HashMap::new()),
        }
    }

    // ── Local processed counter ──────────────────────────────────────────

    /// Highest counter we can prove is durably processed for this chain.
    pub async fn local_processed(
        &self,
        conversation_id: &str,
        sender_device_id: &str,
    ) -> Result<u64, EngineError> {
        let latest = self
            .session
            .vault
            .latest_counters(conversation_id, sender_device_id)
            .await?;
        if latest.incoming > 0 {
            return Ok(latest.incoming);
        }
        if let Some(secret) = self
            .session
            .contact_for_conversation(conversation_id, sender_device_id)
            .await
        {
            if let Some(state) = self.session.sessions.get(&secret.peer_key()).await {
                return Ok(state.nr_total);
            }
        }
        Ok(0)
    }

    // ── Probe ────────────────────────────────────────────────────────────

    /// Compare the server max against local processed; enqueue one job when
    /// the server is ahead. Returns the enqueued target, if any.
    pub async fn probe_max_counter(
        &self,
        conversation_id: &str,
        sender_device_id: &str,
    ) -> Result<Option<u64>, EngineError> {
        let server_max = self
            .session
            .api
            .max_counter(MaxCounterQuery {
                conversation_id: conversation_id.to_string(),
                sender_device_id: sender_device_id.to_string(),
            })
            .await?
            .max_counter;
        let local = self
            .local_processed(conversation_id, sender_device_id)
            .await?;

        if server_max <= local {
            return Ok(None);
        }
        let job = GapJob {
            conversation_id: conversation_id.to_string(),
            sender_device_id: sender_device_id.to_string(),
            target_counter: server_max,
        };
        self.enqueue(job).await;
        tracing::info!(
            target: "sn_engine",
            event = "gap_detected",
            conversation = conversation_id,
            sender_device = sender_device_id,
            server_max,
            local
        );
        Ok(Some(server_max))
    }

    /// FIFO per conversation, kept sorted by target, deduplicated.
    pub async fn enqueue(&self, job: GapJob) {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(job.conversation_id.clone()).or_default();
        if queue.iter().any(|j| {
            j.target_counter == job.target_counter && j.sender_device_id == job.sender_device_id
        }) {
            return;
        }
        queue.push_back(job);
        queue
            .make_contiguous()
            .sort_by_key(|j| j.target_counter);
    }

    pub async fn queued_len(&self, conversation_id: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(conversation_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    // ── Drain ────────────────────────────────────────────────────────────

    /// Drain every queued job for one conversation, serially.
    pub async fn drain_conversation(&self, conversation_id: &str) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            let job = {
                let mut queues = self.queues.lock().await;
                queues.get_mut(conversation_id).and_then(|q| q.pop_front())
            };
            let Some(job) = job else { break };

            let ok = self.run_job(&job, &mut report).await;
            self.session.events.emit(EngineEvent::GapJobFinished {
                conversation_id: job.conversation_id.clone(),
                target_counter: job.target_counter,
                ok,
            });
            if !ok {
                report.aborted = true;
                break;
            }
        }
        report
    }

    /// Drain all conversations: serial within, parallel across.
    pub async fn drain_all(self: &Arc<Self>) -> Vec<DrainReport> {
        let conversations: Vec<String> = {
            let queues = self.queues.lock().await;
            queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut join_set = JoinSet::new();
        for conv in conversations {
            let this = Arc::clone(self);
            join_set.spawn(async move { this.drain_conversation(&conv).await });
        }
        let mut reports = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(report) = joined {
                reports.push(report);
            }
        }
        reports
    }

    /// Fetch and process `local+1..=target` in order. Fetch failures abort
    /// the job after the retry budget; packet-level crypto failures are
    /// recorded and skipped (a newer counter will advance past them).
    async fn run_job(&self, job: &GapJob, report: &mut DrainReport) -> bool {
        let local = match self
            .local_processed(&job.conversation_id, &job.sender_device_id)
            .await
        {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(target: "sn_engine", event = "gap_job_local_unknown", error = %e);
                0
            }
        };

        for counter in (local + 1)..=job.target_counter {
            let raw = match self.fetch_by_counter_with_retry(job, counter).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    tracing::warn!(
                        target: "sn_engine",
                        event = "gap_counter_missing",
                        conversation = %job.conversation_id,
                        counter
                    );
                    report.failed_packets.push(ErrorRecord::new(
                        packet::gap_placeholder_id(counter),
                        job.conversation_id.clone(),
                        ErrorKind::GapQueueFail,
                        "server holds no packet at this counter",
                    ));
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        target: "sn_engine",
                        event = "gap_job_aborted",
                        conversation = %job.conversation_id,
                        counter,
                        error = %e
                    );
                    return false;
                }
            };

            match self.resolve_item(&raw).await {
                Ok(item) => match self.coordinator.process_with_retry(&item).await {
                    Ok(_) => report.processed += 1,
                    Err(e) => {
                        report.failed_packets.push(
                            ErrorRecord::new(
                                item.message_id.clone(),
                                item.conversation_id.clone(),
                                e.kind,
                                e.to_string(),
                            ),
                        );
                    }
                },
                Err(e) => {
                    report.failed_packets.push(ErrorRecord::new(
                        packet::gap_placeholder_id(counter),
                        job.conversation_id.clone(),
                        ErrorKind::Internal,
                        e.to_string(),
                    ));
                }
            }
        }
        true
    }

    async fn resolve_item(&self, raw: &RawPacket) -> Result<ReplayItem, EngineError> {
        let me = self.session.self_identity().await?;
        packet::resolve(raw, &me)
            .map_err(|e| EngineError::new(ErrorKind::Internal, e.to_string()))
    }

    /// Bounded-retry fetch. Network failures wait without consuming the
    /// budget, up to the offline allowance; anything else counts.
    async fn fetch_by_counter_with_retry(
        &self,
        job: &GapJob,
        counter: u64,
    ) -> Result<Option<RawPacket>, EngineError> {
        let config = &self.session.config;
        let mut attempts = 0u32;
        let mut offline_spent = Duration::ZERO;

        loop {
            let result = self
                .session
                .api
                .get_by_counter(ByCounterQuery {
                    conversation_id: job.conversation_id.clone(),
                    counter,
                    sender_device_id: job.sender_device_id.clone(),
                })
                .await;

            match result {
                Ok(packet) => return Ok(packet),
                Err(e) if e.kind == ErrorKind::NetworkUnavailable => {
                    if offline_spent >= config.offline_wait_cap {
                        return Err(EngineError::new(
                            ErrorKind::GapQueueFail,
                            "offline allowance exhausted",
                        )
                        .with_counter(counter));
                    }
                    let wait = config.gap_retry_interval.min(config.delay_cap);
                    offline_spent += wait;
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= config.gap_retry_max {
                        return Err(EngineError::new(
                            ErrorKind::GapQueueFail,
                            format!("fetch failed after {attempts} attempts: {e}"),
                        )
                        .with_counter(counter));
                    }
                    tokio::time::sleep(config.gap_retry_interval.min(config.delay_cap)).await;
                }
            }
        }
    }
}
