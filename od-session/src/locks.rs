use dashmap::DashMap;
use od_channels::ChannelId;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Control operations that must not run concurrently for the same channel.
/// Different kinds on the same channel do not block each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Start,
    Update,
    Remove,
    ClearCache,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::ClearCache => "clear-cache",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LockKey {
    kind: OperationKind,
    channel_id: ChannelId,
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    token: u64,
    acquired_at: Instant,
}

/// Per-(operation, channel) mutual exclusion.
///
/// A failed `try_acquire` means an equivalent operation is already in
/// flight; callers short-circuit with an "already in progress" outcome.
/// Release happens on guard drop, so it runs on every exit path of the
/// protected operation. `expire_stale` is a safety net for guards leaked by
/// panicked tasks: it only removes entries older than the given TTL, never
/// the whole map.
#[derive(Default)]
pub struct OperationLockManager {
    locks: Arc<DashMap<LockKey, LockEntry>>,
    next_token: AtomicU64,
}

impl OperationLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(
        &self,
        kind: OperationKind,
        channel_id: &ChannelId,
    ) -> Option<OperationGuard> {
        let key = LockKey {
            kind,
            channel_id: channel_id.clone(),
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        match self.locks.entry(key.clone()) {
            dashmap::Entry::Occupied(_) => None,
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    token,
                    acquired_at: Instant::now(),
                });
                Some(OperationGuard {
                    locks: self.locks.clone(),
                    key,
                    token,
                })
            }
        }
    }

    pub fn is_held(&self, kind: OperationKind, channel_id: &ChannelId) -> bool {
        self.locks.contains_key(&LockKey {
            kind,
            channel_id: channel_id.clone(),
        })
    }

    /// Remove locks held longer than `ttl`. Returns how many were expired.
    pub fn expire_stale(&self, ttl: Duration) -> usize {
        let before = self.locks.len();
        self.locks.retain(|key, entry| {
            let stale = entry.acquired_at.elapsed() >= ttl;
            if stale {
                tracing::warn!(
                    operation = %key.kind,
                    channel_id = %key.channel_id,
                    held_for_secs = entry.acquired_at.elapsed().as_secs(),
                    "expiring stale operation lock"
                );
            }
            !stale
        });
        before - self.locks.len()
    }

    pub fn held_count(&self) -> usize {
        self.locks.len()
    }
}

/// RAII lock guard; dropping it releases the lock.
pub struct OperationGuard {
    locks: Arc<DashMap<LockKey, LockEntry>>,
    key: LockKey,
    token: u64,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        // Only release our own acquisition: the sweep may have expired this
        // entry and someone else may hold the slot now.
        self.locks
            .remove_if(&self.key, |_, entry| entry.token == self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::{OperationKind, OperationLockManager};
    use od_channels::ChannelId;
    use std::time::Duration;

    #[test]
    fn second_acquire_of_same_key_fails_until_release() {
        let locks = OperationLockManager::new();
        let channel = ChannelId::from("ch-1");

        let guard = locks
            .try_acquire(OperationKind::Start, &channel)
            .expect("first acquire");
        assert!(locks.try_acquire(OperationKind::Start, &channel).is_none());

        drop(guard);
        assert!(locks.try_acquire(OperationKind::Start, &channel).is_some());
    }

    #[test]
    fn different_kinds_and_channels_do_not_contend() {
        let locks = OperationLockManager::new();
        let first = ChannelId::from("ch-1");
        let second = ChannelId::from("ch-2");

        let _start = locks
            .try_acquire(OperationKind::Start, &first)
            .expect("start lock");
        assert!(
            locks
                .try_acquire(OperationKind::ClearCache, &first)
                .is_some(),
            "a different operation kind on the same channel must not block"
        );
        assert!(
            locks.try_acquire(OperationKind::Start, &second).is_some(),
            "the same operation on a different channel must not block"
        );
    }

    #[tokio::test]
    async fn exactly_one_of_n_concurrent_acquires_wins() {
        let locks = OperationLockManager::new();
        let channel = ChannelId::from("ch-race");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move {
                match locks.try_acquire(OperationKind::Start, &channel) {
                    Some(guard) => {
                        // Hold across a yield so the others observe contention.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        drop(guard);
                        1_u32
                    }
                    None => 0,
                }
            }));
        }

        let mut winners = 0;
        for task in tasks {
            winners += task.await.expect("join acquire task");
        }
        assert_eq!(winners, 1, "exactly one concurrent acquire may win");
    }

    #[test]
    fn sweep_only_expires_entries_older_than_ttl() {
        let locks = OperationLockManager::new();
        let channel = ChannelId::from("ch-1");
        let _guard = locks
            .try_acquire(OperationKind::Update, &channel)
            .expect("acquire");

        assert_eq!(locks.expire_stale(Duration::from_secs(60)), 0);
        assert!(
            locks.is_held(OperationKind::Update, &channel),
            "a fresh lock must survive the sweep"
        );

        assert_eq!(locks.expire_stale(Duration::ZERO), 1);
        assert!(!locks.is_held(OperationKind::Update, &channel));
    }

    #[test]
    fn guard_drop_does_not_release_a_reacquired_lock() {
        let locks = OperationLockManager::new();
        let channel = ChannelId::from("ch-1");

        let leaked = locks
            .try_acquire(OperationKind::Start, &channel)
            .expect("first acquire");
        locks.expire_stale(Duration::ZERO);
        let _current = locks
            .try_acquire(OperationKind::Start, &channel)
            .expect("reacquire after expiry");

        drop(leaked);
        assert!(
            locks.is_held(OperationKind::Start, &channel),
            "dropping the expired guard must not release the new owner"
        );
    }
}
