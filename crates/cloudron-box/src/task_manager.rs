// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-app task exclusivity.
//!
//! At most one pipeline runs per app id. A [`TaskLease`] is acquired before the first step and
//! dropped by the spawned task after the terminal state has been persisted. A second request
//! for the same id while the lease is held fails with [`Error::Locked`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    locked: Mutex<HashSet<String>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

// The guarded sets stay consistent even if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive right to run a pipeline for one app. Released on drop.
pub struct TaskLease {
    app_id: String,
    inner: Arc<Inner>,
}

impl TaskLease {
    /// The app this lease is for.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        lock(&self.inner.locked).remove(&self.app_id);
        debug!(app_id = %self.app_id, "Released task lease");
    }
}

impl std::fmt::Debug for TaskLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLease")
            .field("app_id", &self.app_id)
            .finish()
    }
}

/// Tracks per-app leases and the pipeline tasks holding them.
#[derive(Clone, Default)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    /// Create an empty task manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lease for `app_id`, failing with `Locked` if a pipeline holds it.
    pub fn try_acquire(&self, app_id: &str) -> Result<TaskLease> {
        let mut locked = lock(&self.inner.locked);
        if !locked.insert(app_id.to_string()) {
            return Err(Error::Locked(app_id.to_string()));
        }
        debug!(app_id = %app_id, "Acquired task lease");
        Ok(TaskLease {
            app_id: app_id.to_string(),
            inner: self.inner.clone(),
        })
    }

    /// Whether a pipeline holds the lease for `app_id`.
    pub fn is_locked(&self, app_id: &str) -> bool {
        lock(&self.inner.locked).contains(app_id)
    }

    /// Ids of apps with a running pipeline.
    pub fn locked_apps(&self) -> Vec<String> {
        let mut apps: Vec<String> = lock(&self.inner.locked).iter().cloned().collect();
        apps.sort();
        apps
    }

    /// Run `task` in the background. The lease is released when the task ends.
    pub fn spawn<F>(&self, lease: TaskLease, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app_id = lease.app_id.clone();
        let handle = tokio::spawn(async move {
            task.await;
            drop(lease);
        });

        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|_, h| !h.is_finished());
        tasks.insert(app_id, handle);
    }

    /// Wait for the pipeline of `app_id` to finish, if one was spawned.
    pub async fn wait(&self, app_id: &str) {
        let handle = lock(&self.inner.tasks).remove(app_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Wait for every spawned pipeline to finish.
    pub async fn wait_all(&self) {
        let handles: Vec<_> = lock(&self.inner.tasks).drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    #[test]
    fn test_lease_is_exclusive() {
        let manager = TaskManager::new();
        let lease = manager.try_acquire("app-1").unwrap();
        assert_eq!(
            manager.try_acquire("app-1").unwrap_err().kind(),
            ErrorKind::Locked
        );
        // other apps are independent
        let _other = manager.try_acquire("app-2").unwrap();

        drop(lease);
        assert!(!manager.is_locked("app-1"));
        manager.try_acquire("app-1").unwrap();
    }

    #[tokio::test]
    async fn test_spawn_releases_lease() {
        let manager = TaskManager::new();
        let lease = manager.try_acquire("app-1").unwrap();

        manager.spawn(lease, async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        assert!(manager.is_locked("app-1"));
        assert_eq!(manager.locked_apps(), vec!["app-1".to_string()]);

        manager.wait("app-1").await;
        assert!(!manager.is_locked("app-1"));
    }

    #[tokio::test]
    async fn test_wait_all() {
        let manager = TaskManager::new();
        for id in ["a", "b", "c"] {
            let lease = manager.try_acquire(id).unwrap();
            manager.spawn(lease, async {
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }
        manager.wait_all().await;
        assert!(manager.locked_apps().is_empty());
    }
}
