//! Per-application update lock.
//!
//! Steps that disturb a running service take the lock of the service's
//! application first. The in-process part is a mutex per app id; on top of
//! that, a user container can block updates by creating an `updates.lock`
//! file in its lock directory (`{lock_dir}/{appId}/{serviceName}/`).

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skiff_events::{EventKind, EventSink, ResourceRef, SystemEvent};
use skiff_id::AppId;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::{ComposeError, Result};

/// Name of the lock file a service may create to hold off updates.
pub const LOCK_FILE: &str = "updates.lock";

pub struct UpdateLocks {
    /// Per-app locks, created on first use.
    locks: Mutex<HashMap<AppId, Arc<tokio::sync::Mutex<()>>>>,
    lock_dir: PathBuf,
    timeout: Duration,
    events: Arc<dyn EventSink>,
}

/// Held for as long as the lock is.
pub struct UpdateLockGuard {
    app_id: AppId,
    /// `None` when a forced acquisition overrode someone else's hold.
    _held: Option<OwnedMutexGuard<()>>,
    events: Arc<dyn EventSink>,
}

impl Drop for UpdateLockGuard {
    fn drop(&mut self) {
        debug!(app_id = %self.app_id, "Releasing update lock");
        self.events.emit(
            SystemEvent::new(EventKind::ReleaseLock).with_resource(ResourceRef::App {
                app_id: self.app_id,
            }),
        );
    }
}

impl UpdateLocks {
    pub fn new(lock_dir: impl Into<PathBuf>, timeout: Duration, events: Arc<dyn EventSink>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            lock_dir: lock_dir.into(),
            timeout,
            events,
        }
    }

    fn app_lock(&self, app_id: AppId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(app_id).or_default().clone()
    }

    /// Runs `body` while holding the lock of `app_id`.
    ///
    /// Without `force`, waits up to the configured timeout for another holder
    /// and refuses while a service holds a lock file. With `force`, lock files
    /// are deleted and a current holder is overridden. The lock is released
    /// however `body` finishes.
    pub async fn with_lock<F, Fut, T>(&self, app_id: AppId, force: bool, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.acquire(app_id, force).await?;
        body().await
    }

    pub async fn acquire(&self, app_id: AppId, force: bool) -> Result<UpdateLockGuard> {
        let files = self.lock_files(app_id).await?;
        if !files.is_empty() {
            if !force {
                info!(app_id = %app_id, count = files.len(), "Updates locked by service");
                return Err(ComposeError::UpdatesLocked { app_id });
            }
            for file in &files {
                warn!(path = %file.display(), "Overriding service update lock");
                match tokio::fs::remove_file(file).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.emit(EventKind::LockOverridden, app_id);
        }

        let lock = self.app_lock(app_id);
        let held = if force {
            match lock.try_lock_owned() {
                Ok(guard) => Some(guard),
                Err(_) => {
                    warn!(app_id = %app_id, "Overriding held update lock");
                    self.emit(EventKind::LockOverridden, app_id);
                    None
                }
            }
        } else {
            match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
                Ok(guard) => Some(guard),
                Err(_) => {
                    info!(app_id = %app_id, "Timed out waiting for update lock");
                    return Err(ComposeError::UpdatesLocked { app_id });
                }
            }
        };

        debug!(app_id = %app_id, force, "Took update lock");
        self.emit(EventKind::TakeLock, app_id);
        Ok(UpdateLockGuard {
            app_id,
            _held: held,
            events: self.events.clone(),
        })
    }

    async fn lock_files(&self, app_id: AppId) -> Result<Vec<PathBuf>> {
        let app_dir = self.lock_dir.join(app_id.to_string());
        let mut entries = match tokio::fs::read_dir(&app_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let candidate = entry.path().join(LOCK_FILE);
            if is_file(&candidate).await {
                files.push(candidate);
            }
        }
        Ok(files)
    }

    fn emit(&self, kind: EventKind, app_id: AppId) {
        self.events
            .emit(SystemEvent::new(kind).with_resource(ResourceRef::App { app_id }));
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use skiff_events::MemorySink;

    fn locks(dir: &Path, timeout: Duration) -> (Arc<UpdateLocks>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (Arc::new(UpdateLocks::new(dir, timeout, sink.clone())), sink)
    }

    fn app(id: u32) -> AppId {
        AppId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_same_app_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let (locks, _) = locks(dir.path(), Duration::from_secs(5));
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let (locks, active, max) = (locks.clone(), active.clone(), max.clone());
                tokio::spawn(async move {
                    locks
                        .with_lock(app(1), false, || async {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(max.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_apps_do_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let (locks, _) = locks(dir.path(), Duration::from_secs(5));
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let run = |id: u32| {
            let (locks, barrier) = (locks.clone(), barrier.clone());
            tokio::spawn(async move {
                locks
                    .with_lock(app(id), false, || async {
                        barrier.wait().await;
                        Ok(())
                    })
                    .await
            })
        };
        let (a, b) = (run(1), run(2));
        let joined = tokio::time::timeout(Duration::from_secs(2), async {
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();
        })
        .await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_contended_lock_times_out_and_force_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let (locks, sink) = locks(dir.path(), Duration::from_millis(50));
        let held = locks.acquire(app(1), false).await.unwrap();

        let err = locks.acquire(app(1), false).await.err().unwrap();
        assert!(matches!(err, ComposeError::UpdatesLocked { .. }));

        let forced = locks.with_lock(app(1), true, || async { Ok(7) }).await.unwrap();
        assert_eq!(forced, 7);
        assert_eq!(sink.count(EventKind::LockOverridden), 1);
        drop(held);

        locks.acquire(app(1), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_body_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let (locks, sink) = locks(dir.path(), Duration::from_millis(50));
        let result: Result<()> = locks
            .with_lock(app(1), false, || async {
                Err(ComposeError::InternalInconsistency("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(sink.count(EventKind::ReleaseLock), 1);
        locks.acquire(app(1), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_files() {
        let dir = tempfile::tempdir().unwrap();
        let (locks, _) = locks(dir.path(), Duration::from_millis(50));
        let service_dir = dir.path().join("1").join("main");
        std::fs::create_dir_all(&service_dir).unwrap();
        std::fs::write(service_dir.join(LOCK_FILE), b"").unwrap();

        assert!(matches!(
            locks.acquire(app(1), false).await,
            Err(ComposeError::UpdatesLocked { .. })
        ));
        // Other apps are unaffected
        locks.acquire(app(2), false).await.unwrap();

        locks.acquire(app(1), true).await.unwrap();
        assert!(!service_dir.join(LOCK_FILE).exists());
        locks.acquire(app(1), false).await.unwrap();
    }
}
