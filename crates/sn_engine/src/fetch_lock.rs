//! Per-conversation secure-fetch lock.
//!
//! Replay and live fetchers both pull packets for a conversation; only one
//! may drive it at a time. The lock is owner-tagged and priority-aware:
//! a live acquisition preempts a replay holder by raising its cancellation
//! flag — the replay holder observes the flag at its next suspension point
//! and releases promptly. Live never preempts live; replay never preempts
//! anyone and simply waits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOwner {
    Live,
    Replay,
}

struct ConversationLock {
    mutex: Arc<Mutex<()>>,
    /// Cancellation flag of the current holder, if any.
    holder: Mutex<Option<(FetchOwner, Arc<AtomicBool>)>>,
}

impl ConversationLock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mutex: Arc::new(Mutex::new(())),
            holder: Mutex::new(None),
        })
    }
}

/// Guard for one conversation. Dropping releases the lock; holders doing
/// long work must poll `is_cancelled` at suspension points.
pub struct FetchGuard {
    _guard: OwnedMutexGuard<()>,
    lock: Arc<ConversationLock>,
    cancelled: Arc<AtomicBool>,
}

impl FetchGuard {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Shareable view of the cancellation flag, for work fanned out to
    /// other tasks while the guard is held.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        // Clear the holder slot if it is still ours.
        let lock = Arc::clone(&self.lock);
        let flag = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            let mut holder = lock.holder.lock().await;
            if let Some((_, ref current)) = *holder {
                if Arc::ptr_eq(current, &flag) {
                    *holder = None;
                }
            }
        });
    }
}

#[derive(Default)]
pub struct FetchLockMap {
    locks: Mutex<HashMap<String, Arc<ConversationLock>>>,
}

impl FetchLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    async fn conversation(&self, conversation_id: &str) -> Arc<ConversationLock> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(ConversationLock::new)
            .clone()
    }

    /// Acquire the conversation for `owner`. A live caller first raises the
    /// cancellation flag of a replay holder so the wait stays short.
    pub async fn acquire(&self, conversation_id: &str, owner: FetchOwner) -> FetchGuard {
        let lock = self.conversation(conversation_id).await;

        if owner == FetchOwner::Live {
            let holder = lock.holder.lock().await;
            if let Some((FetchOwner::Replay, ref flag)) = *holder {
                flag.store(true, Ordering::SeqCst);
                tracing::debug!(
                    target: "sn_engine",
                    event = "fetch_lock_preempt",
                    conversation = conversation_id
                );
            }
        }

        let guard = Arc::clone(&lock.mutex).lock_owned().await;
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut holder = lock.holder.lock().await;
            *holder = Some((owner, Arc::clone(&cancelled)));
        }
        FetchGuard {
            _guard: guard,
            lock,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn replay_holder_sees_live_preemption() {
        let map = Arc::new(FetchLockMap::new());

        let replay = map.acquire("conv", FetchOwner::Replay).await;
        assert!(!replay.is_cancelled());

        // Live wants in: the replay holder's flag goes up before the live
        // task even gets the mutex.
        let map2 = Arc::clone(&map);
        let live = tokio::spawn(async move { map2.acquire("conv", FetchOwner::Live).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(replay.is_cancelled(), "replay must observe the preemption");

        drop(replay);
        let live_guard = live.await.unwrap();
        assert!(!live_guard.is_cancelled());
    }

    #[tokio::test]
    async fn independent_conversations_do_not_contend() {
        let map = FetchLockMap::new();
        let a = map.acquire("conv-a", FetchOwner::Replay).await;
        let b = map.acquire("conv-b", FetchOwner::Replay).await;
        assert!(!a.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[tokio::test]
    async fn live_does_not_preempt_live() {
        let map = Arc::new(FetchLockMap::new());
        let first = map.acquire("conv", FetchOwner::Live).await;

        let map2 = Arc::clone(&map);
        let second = tokio::spawn(async move { map2.acquire("conv", FetchOwner::Live).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!first.is_cancelled());

        drop(first);
        second.await.unwrap();
    }
}
