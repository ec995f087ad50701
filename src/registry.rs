use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::warn;

use crate::models::{SandboxId, SandboxState, SandboxSummary, UserIdentity};

/// Bounded counter of sessions attached to one sandbox.
///
/// Acquire and release are single atomic read-modify-write operations, so the
/// caller that takes the count from 1 to 0 learns it from `release` itself and
/// never from a later read of the count.
#[derive(Debug)]
pub struct SessionSlots {
    active: AtomicUsize,
    capacity: usize,
}

impl SessionSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Takes a slot unless all `capacity` slots are in use.
    pub fn try_acquire(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.capacity).then_some(active + 1)
            })
            .is_ok()
    }

    /// Gives a slot back. Returns true for the release that emptied the set.
    pub fn release(&self) -> bool {
        match self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                active.checked_sub(1)
            }) {
            Ok(previous) => previous == 1,
            Err(_) => {
                warn!("session slot released with no slot held");
                false
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Per-user sandbox state. Lives for the rest of the process once registered.
#[derive(Debug)]
pub struct SandboxRecord {
    user: UserIdentity,
    sandbox_id: SandboxId,
    slots: SessionSlots,
    /// Start and stop both run under this lock.
    state: Mutex<SandboxState>,
    stop_pending: AtomicBool,
    registered_at: DateTime<Utc>,
}

impl SandboxRecord {
    pub fn new(
        user: UserIdentity,
        sandbox_id: SandboxId,
        state: SandboxState,
        capacity: usize,
    ) -> Self {
        Self {
            user,
            sandbox_id,
            slots: SessionSlots::new(capacity),
            state: Mutex::new(state),
            stop_pending: AtomicBool::new(false),
            registered_at: Utc::now(),
        }
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn sandbox_id(&self) -> &SandboxId {
        &self.sandbox_id
    }

    pub fn active_sessions(&self) -> usize {
        self.slots.active()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn is_stop_pending(&self) -> bool {
        self.stop_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_stop_pending(&self, pending: bool) {
        self.stop_pending.store(pending, Ordering::Release);
    }

    pub async fn state(&self) -> SandboxState {
        *self.state.lock().await
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().await
    }

    /// Claims one session slot, or `None` when the sandbox is at capacity.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SessionLease> {
        self.slots.try_acquire().then(|| SessionLease {
            record: Arc::clone(self),
            released: false,
        })
    }

    pub async fn summary(&self) -> SandboxSummary {
        SandboxSummary {
            user: self.user.clone(),
            sandbox_id: self.sandbox_id.clone(),
            state: self.state().await,
            active_sessions: self.active_sessions(),
            max_sessions: self.capacity(),
            stop_pending: self.is_stop_pending(),
            registered_at: self.registered_at,
        }
    }
}

/// A held session slot.
///
/// Release it with [`SessionLease::release`] so the caller can stop the
/// sandbox when it was the last one out. A lease dropped without release
/// (its session future was cancelled) still frees the slot and leaves the
/// stop to the retry loop.
#[derive(Debug)]
pub struct SessionLease {
    record: Arc<SandboxRecord>,
    released: bool,
}

impl SessionLease {
    pub fn record(&self) -> &Arc<SandboxRecord> {
        &self.record
    }

    pub fn release(mut self) -> bool {
        self.released = true;
        self.record.slots.release()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.record.slots.release() {
            warn!(
                user = %self.record.user,
                "last session dropped without release; deferring sandbox stop"
            );
            self.record.set_stop_pending(true);
        }
    }
}

/// Maps each user to their sandbox record. Cloning shares the same map.
#[derive(Clone, Debug, Default)]
pub struct SandboxRegistry {
    inner: Arc<RwLock<HashMap<UserIdentity, Arc<SandboxRecord>>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` unless the user already has one. Returns whichever
    /// record is registered afterwards.
    pub async fn register(&self, record: SandboxRecord) -> Arc<SandboxRecord> {
        let mut guard = self.inner.write().await;
        guard
            .entry(record.user.clone())
            .or_insert_with(|| Arc::new(record))
            .clone()
    }

    pub async fn lookup(&self, user: &UserIdentity) -> Option<Arc<SandboxRecord>> {
        let guard = self.inner.read().await;
        guard.get(user).cloned()
    }

    pub async fn records(&self) -> Vec<Arc<SandboxRecord>> {
        let guard = self.inner.read().await;
        guard.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user: &str, capacity: usize) -> SandboxRecord {
        SandboxRecord::new(
            user.into(),
            SandboxId::new(format!("{user}-id")),
            SandboxState::Created,
            capacity,
        )
    }

    #[test]
    fn slots_are_bounded_and_report_last_release() {
        let slots = SessionSlots::new(2);
        assert!(slots.try_acquire());
        assert!(slots.try_acquire());
        assert!(!slots.try_acquire());
        assert_eq!(slots.active(), 2);

        assert!(!slots.release());
        assert!(slots.release());
        assert_eq!(slots.active(), 0);

        // Releasing an empty set never underflows and is never "last".
        assert!(!slots.release());
        assert_eq!(slots.active(), 0);
    }

    #[test]
    fn exactly_one_concurrent_release_is_last() {
        let slots = Arc::new(SessionSlots::new(64));
        for _ in 0..64 {
            assert!(slots.try_acquire());
        }

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let slots = Arc::clone(&slots);
                std::thread::spawn(move || slots.release())
            })
            .collect();
        let last = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|is_last| *is_last)
            .count();

        assert_eq!(last, 1);
        assert_eq!(slots.active(), 0);
    }

    #[tokio::test]
    async fn register_keeps_first_record_per_user() {
        let registry = SandboxRegistry::new();
        assert!(registry.lookup(&"alice".into()).await.is_none());

        let first = registry.register(record("alice", 20)).await;
        let second = registry
            .register(SandboxRecord::new(
                "alice".into(),
                SandboxId::new("other"),
                SandboxState::Unknown,
                20,
            ))
            .await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.sandbox_id().as_str(), "alice-id");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn registries_are_independent() {
        let one = SandboxRegistry::new();
        let two = SandboxRegistry::new();
        one.register(record("alice", 20)).await;

        assert!(one.lookup(&"alice".into()).await.is_some());
        assert!(two.lookup(&"alice".into()).await.is_none());
    }

    #[tokio::test]
    async fn dropped_last_lease_marks_stop_pending() {
        let registry = SandboxRegistry::new();
        let carol = registry.register(record("carol", 2)).await;

        let first = carol.try_acquire().unwrap();
        let second = carol.try_acquire().unwrap();
        assert!(carol.try_acquire().is_none());

        assert!(!first.release());
        drop(second);

        assert_eq!(carol.active_sessions(), 0);
        assert!(carol.is_stop_pending());
    }
}
