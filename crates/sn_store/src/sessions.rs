//! In-memory Double Ratchet session store.
//!
//! One `DrState` per `PeerKey`, never more. The store itself hands out deep
//! copies and accepts whole-state commits; serialization of mutations is the
//! live coordinator's job (per-peer lock) — any path that writes a state
//! outside that lock is a bug.
//!
//! Every create/clear appends to a bounded trace ring for forensics.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use sn_crypto::identity::{AccountDigest, PeerKey};
use sn_crypto::ratchet::DrState;

use crate::error::StoreError;

const TRACE_CAPACITY: usize = 256;

// ── Trace ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SessionTraceEvent {
    pub at: DateTime<Utc>,
    pub peer: String,
    pub action: &'static str,
    pub ns_total: u64,
    pub nr_total: u64,
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

/// Versioned, serializable copy of one DR state. Keys inside render as
/// base64; this is what gets MK-wrapped and shipped to the backup layer.
#[derive(Serialize, Deserialize)]
pub struct DrSnapshot {
    pub v: u8,
    pub peer: String,
    pub state: DrState,
    pub updated_at: DateTime<Utc>,
}

// ── Store ────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct SessionStore {
    states: Arc<RwLock<HashMap<PeerKey, DrState>>>,
    trace: Arc<RwLock<VecDeque<SessionTraceEvent>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of the state for `peer`, if any.
    pub async fn get(&self, peer: &PeerKey) -> Option<DrState> {
        self.states.read().await.get(peer).cloned()
    }

    pub async fn contains(&self, peer: &PeerKey) -> bool {
        self.states.read().await.contains_key(peer)
    }

    /// Install a state for `peer`. First write records a `create` trace; the
    /// single-state-per-peer invariant makes later writes plain commits.
    pub async fn commit(&self, peer: &PeerKey, state: DrState) {
        let mut states = self.states.write().await;
        let created = !states.contains_key(peer);
        let (ns_total, nr_total) = (state.ns_total, state.nr_total);
        states.insert(peer.clone(), state);
        drop(states);
        if created {
            self.push_trace(peer, "create", ns_total, nr_total).await;
        }
    }

    /// Remove the state for one endpoint (logout / reset only).
    pub async fn clear(&self, peer: &PeerKey) {
        let removed = self.states.write().await.remove(peer);
        if let Some(state) = removed {
            self.push_trace(peer, "clear", state.ns_total, state.nr_total)
                .await;
        }
    }

    /// Remove every session belonging to an account (all of its devices).
    pub async fn clear_by_account(&self, digest: &AccountDigest) {
        let mut states = self.states.write().await;
        let victims: Vec<PeerKey> = states
            .keys()
            .filter(|k| k.digest() == digest)
            .cloned()
            .collect();
        let mut cleared = Vec::new();
        for peer in victims {
            if let Some(state) = states.remove(&peer) {
                cleared.push((peer, state.ns_total, state.nr_total));
            }
        }
        drop(states);
        for (peer, ns, nr) in cleared {
            self.push_trace(&peer, "clear", ns, nr).await;
        }
    }

    pub async fn peer_keys(&self) -> Vec<PeerKey> {
        self.states.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    /// Serializable snapshot of one session for the wrapped-backup layer.
    pub async fn snapshot(&self, peer: &PeerKey) -> Result<DrSnapshot, StoreError> {
        let state = self
            .get(peer)
            .await
            .ok_or_else(|| StoreError::SessionMissing(peer.to_string()))?;
        Ok(DrSnapshot {
            v: 1,
            peer: peer.to_string(),
            state,
            updated_at: Utc::now(),
        })
    }

    /// Restore a snapshot produced by `snapshot`. Used on unlock to hydrate
    /// sessions out of contact secrets and the remote backup.
    pub async fn hydrate(&self, snapshot: DrSnapshot) -> Result<PeerKey, StoreError> {
        let peer = PeerKey::parse(&snapshot.peer)?;
        self.commit(&peer, snapshot.state).await;
        Ok(peer)
    }

    // ── Trace ────────────────────────────────────────────────────────────

    async fn push_trace(&self, peer: &PeerKey, action: &'static str, ns_total: u64, nr_total: u64) {
        let mut trace = self.trace.write().await;
        if trace.len() >= TRACE_CAPACITY {
            trace.pop_front();
        }
        let event = SessionTraceEvent {
            at: Utc::now(),
            peer: peer.to_string(),
            action,
            ns_total,
            nr_total,
        };
        tracing::debug!(
            target: "sn_store",
            event = "session_state_change",
            peer = %event.peer,
            action,
            ns_total,
            nr_total
        );
        trace.push_back(event);
    }

    pub async fn trace(&self) -> Vec<SessionTraceEvent> {
        self.trace.read().await.iter().cloned().collect()
    }
}
