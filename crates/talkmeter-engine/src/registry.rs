//! Bookkeeping for running deduction drivers and per-session locks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use talkmeter_core::SessionId;

struct DriverHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The set of deduction drivers currently running, at most one per session.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Mutex<HashMap<SessionId, DriverHandle>>,
    next_generation: AtomicU64,
}

impl DriverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn drivers(&self) -> MutexGuard<'_, HashMap<SessionId, DriverHandle>> {
        self.drivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the driver built by `make` unless one is already running for
    /// `session_id`.
    ///
    /// The check and the insert happen under one lock, so concurrent callers
    /// cannot both spawn. `make` receives the driver's generation and its
    /// cancellation token. Returns whether a driver was spawned.
    pub fn spawn_if_absent<F, Fut>(&self, session_id: SessionId, make: F) -> bool
    where
        F: FnOnce(u64, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut drivers = self.drivers();
        if drivers
            .get(&session_id)
            .is_some_and(|existing| !existing.task.is_finished())
        {
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(make(generation, cancel.clone()));
        drivers.insert(
            session_id,
            DriverHandle {
                generation,
                cancel,
                task,
            },
        );
        true
    }

    /// Stop the driver for `session_id`, if any. Returns whether one was
    /// registered.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        match self.drivers().remove(session_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Deregister a driver that is exiting on its own.
    ///
    /// Only removes the entry if it still belongs to `generation`; a newer
    /// driver for the same session is left alone.
    pub fn release(&self, session_id: &SessionId, generation: u64) {
        let mut drivers = self.drivers();
        if drivers
            .get(session_id)
            .is_some_and(|handle| handle.generation == generation)
        {
            drivers.remove(session_id);
        }
    }

    /// Whether a live driver is registered for `session_id`.
    #[must_use]
    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.drivers()
            .get(session_id)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Number of registered drivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.drivers().len()
    }

    /// Whether no driver is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every driver.
    pub fn cancel_all(&self) {
        for (_, handle) in self.drivers().drain() {
            handle.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.len())
            .finish_non_exhaustive()
    }
}

/// Per-session async mutexes.
///
/// Every read-modify-write of a session record (driver tick, lifecycle
/// transition, sweeper repair) holds the session's lock, so updates are never
/// lost to an interleaving writer.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: DashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`.
    pub async fn lock(&self, session_id: SessionId) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(self.locks.entry(session_id).or_default().value());
        mutex.lock_owned().await
    }

    /// Drop the lock entry for a finished session if nobody holds or awaits it.
    pub fn prune(&self, session_id: &SessionId) {
        self.locks
            .remove_if(session_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    /// Number of lock entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_spawn_is_refused_while_running() {
        let registry = DriverRegistry::new();
        let id = SessionId::generate();

        assert!(registry.spawn_if_absent(id, |_, cancel| async move { cancel.cancelled().await }));
        assert!(!registry.spawn_if_absent(id, |_, cancel| async move { cancel.cancelled().await }));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_running(&id));

        assert!(registry.cancel(&id));
        assert!(!registry.is_running(&id));
        assert!(registry.spawn_if_absent(id, |_, cancel| async move { cancel.cancelled().await }));
        registry.cancel_all();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn release_ignores_other_generations() {
        let registry = DriverRegistry::new();
        let id = SessionId::generate();
        let mut first = None;
        registry.spawn_if_absent(id, |generation, cancel| {
            first = Some(generation);
            async move { cancel.cancelled().await }
        });
        let first = first.unwrap();

        registry.release(&id, first + 1);
        assert!(registry.is_running(&id));

        registry.release(&id, first);
        assert!(!registry.is_running(&id));
    }

    #[tokio::test]
    async fn session_lock_is_exclusive() {
        let locks = SessionLocks::new();
        let id = SessionId::generate();

        let guard = locks.lock(id).await;
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), locks.lock(id)).await;
        assert!(pending.is_err());

        drop(guard);
        let _again = locks.lock(id).await;
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = SessionLocks::new();
        let id = SessionId::generate();

        let guard = locks.lock(id).await;
        locks.prune(&id);
        assert_eq!(locks.len(), 1);

        drop(guard);
        locks.prune(&id);
        assert!(locks.is_empty());
    }
}
