//! Time-bounded registry of live jobs.

use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use notary_core::Handle;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, trace, warn};

use super::job::Job;
use crate::config::RegistryConfig;

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub live: usize,
    pub inserted: u64,
    pub hits: u64,
    pub misses: u64,
    pub evicted: u64,
    /// Evicted jobs whose cleanup has finished.
    pub cleaned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    inserted: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
    cleaned: AtomicU64,
}

#[derive(Debug)]
struct Entry {
    job: Arc<Job>,
    expires_at: Instant,
}

struct Evicted {
    handle: Handle,
    job: Arc<Job>,
}

struct Inner {
    entries: DashMap<Handle, Entry>,
    ttl: Duration,
    runtime: RuntimeHandle,
    evictions: mpsc::UnboundedSender<Evicted>,
    counters: Arc<Counters>,
}

/// Maps handles to jobs for a fixed time after registration.
///
/// When an entry expires its job is cancelled (if still running) and its file
/// deleted. Cleanup runs on separate tasks, so a slow deletion never holds up
/// lookups or other evictions.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("ttl", &self.inner.ttl)
            .field("live", &self.inner.entries.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// `config.ttl` is capped at [`RegistryConfig::MAX_TTL`].
    pub fn new(config: &RegistryConfig, runtime: &RuntimeHandle) -> Self {
        let ttl = config.ttl.min(RegistryConfig::MAX_TTL);
        if ttl < config.ttl {
            warn!(
                requested = %humantime::format_duration(config.ttl),
                ttl = %humantime::format_duration(ttl),
                "registry ttl capped"
            );
        }
        let (evictions, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        runtime.spawn(eviction_listener(
            rx,
            runtime.clone(),
            config.cancel_wait,
            Arc::clone(&counters),
        ));

        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                ttl,
                runtime: runtime.clone(),
                evictions,
                counters,
            }),
        }
    }

    /// Register `job` under a fresh handle.
    pub fn put(&self, job: Arc<Job>) -> Handle {
        self.put_with(job, Handle::random)
    }

    /// Register `job` under the first handle from `next_handle` not already
    /// taken. The check and the insert happen under one shard lock.
    pub(crate) fn put_with<G>(&self, job: Arc<Job>, mut next_handle: G) -> Handle
    where
        G: FnMut() -> Handle,
    {
        let now = Instant::now();
        // The ttl is capped, so this only fails on a clock near its own limit.
        let expires_at = now.checked_add(self.inner.ttl).unwrap_or(now);
        let handle = loop {
            let candidate = next_handle();
            match self.inner.entries.entry(candidate) {
                MapEntry::Occupied(_) => {
                    warn!(handle = %candidate, "handle collision; generating another one");
                }
                MapEntry::Vacant(slot) => {
                    slot.insert(Entry {
                        job: Arc::clone(&job),
                        expires_at,
                    });
                    break candidate;
                }
            }
        };

        self.inner.counters.inserted.fetch_add(1, Ordering::Relaxed);
        trace!(%handle, ttl_ms = self.inner.ttl.as_millis() as u64, "job registered");

        let weak = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(handle);
            }
        });

        handle
    }

    /// The job registered under `handle`, unless unknown or expired.
    pub fn get(&self, handle: Handle) -> Option<Arc<Job>> {
        let now = Instant::now();
        let found = self
            .inner
            .entries
            .get(&handle)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| Arc::clone(&entry.job));

        let counter = if found.is_some() {
            &self.inner.counters.hits
        } else {
            &self.inner.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn stats(&self) -> RegistryStats {
        let c = &self.inner.counters;
        RegistryStats {
            live: self.inner.entries.len(),
            inserted: c.inserted.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            cleaned: c.cleaned.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn expire(&self, handle: Handle) {
        let now = Instant::now();
        let Some((handle, entry)) = self
            .entries
            .remove_if(&handle, |_, entry| entry.expires_at <= now)
        else {
            return;
        };

        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        debug!(%handle, "submission expired");
        if self
            .evictions
            .send(Evicted {
                handle,
                job: entry.job,
            })
            .is_err()
        {
            warn!(%handle, "eviction listener is gone; expired file will not be deleted");
        }
    }
}

async fn eviction_listener(
    mut rx: mpsc::UnboundedReceiver<Evicted>,
    runtime: RuntimeHandle,
    cancel_wait: Duration,
    counters: Arc<Counters>,
) {
    while let Some(evicted) = rx.recv().await {
        let span = info_span!("eviction", handle = %evicted.handle);
        runtime.spawn(cleanup(evicted, cancel_wait, Arc::clone(&counters)).instrument(span));
    }
    trace!("eviction listener stopped");
}

async fn cleanup(evicted: Evicted, cancel_wait: Duration, counters: Arc<Counters>) {
    let Evicted { handle, job } = evicted;

    if !job.is_done() {
        warn!(%handle, "submission expired before finishing; cancelling it");
        job.cancel();
        if job.await_result(cancel_wait).await.is_none() {
            warn!(
                %handle,
                wait_ms = cancel_wait.as_millis() as u64,
                "job did not stop in time; deleting its file anyway"
            );
        }
    }

    let file = job.file();
    match tokio::fs::remove_file(file).await {
        Ok(()) => debug!(%handle, file = %file.display(), "deleted expired file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(%handle, file = %file.display(), "expired file was already deleted");
        }
        Err(e) => warn!(%handle, file = %file.display(), error = %e, "failed to delete expired file"),
    }

    counters.cleaned.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;

    use notary_core::{InfoResult, JobOptions, State, UploadResult};

    use super::*;
    use crate::adapter::StageError;
    use crate::jobs::job::{StageContext, Stages};

    fn config(ttl: Duration) -> RegistryConfig {
        RegistryConfig {
            ttl,
            cancel_wait: Duration::from_secs(5),
        }
    }

    fn finished_job(file: PathBuf) -> Arc<Job> {
        Job::spawn(
            file,
            None,
            JobOptions::new(),
            Stages::new(
                |_| async { Ok(UploadResult::successful("id", "ok")) },
                |_, _| async { Ok(InfoResult::successful("ok")) },
            ),
            &RuntimeHandle::current(),
        )
    }

    fn stuck_job(file: PathBuf) -> Arc<Job> {
        Job::spawn(
            file,
            None,
            JobOptions::new(),
            Stages::new(
                |ctx: StageContext| async move {
                    ctx.cancel.cancelled().await;
                    Err(StageError::Cancelled)
                },
                |_, _| async { Ok(InfoResult::successful("ok")) },
            ),
            &RuntimeHandle::current(),
        )
    }

    async fn wait_for_cleanup(registry: &Registry, expected: u64) {
        for _ in 0..200 {
            if registry.stats().cleaned >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("cleanup did not happen: {:?}", registry.stats());
    }

    #[tokio::test]
    async fn put_then_get_returns_the_job() {
        let registry = Registry::new(&config(Duration::from_secs(60)), &RuntimeHandle::current());
        let job = finished_job(PathBuf::from("/nonexistent/a.zip"));
        let handle = registry.put(Arc::clone(&job));

        let found = registry.get(handle).unwrap();
        assert!(Arc::ptr_eq(&found, &job));
        assert!(registry.get(Handle::random()).is_none());

        let stats = registry.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn oversized_ttl_is_capped_instead_of_overflowing() {
        let huge = RegistryConfig {
            ttl: Duration::MAX,
            cancel_wait: Duration::from_secs(5),
        };
        let registry = Registry::new(&huge, &RuntimeHandle::current());
        assert_eq!(registry.ttl(), RegistryConfig::MAX_TTL);

        let handle = registry.put(finished_job(PathBuf::from("/nonexistent/a.zip")));
        assert!(registry.get(handle).is_some());
    }

    #[tokio::test]
    async fn colliding_handle_is_regenerated() {
        let registry = Registry::new(&config(Duration::from_secs(60)), &RuntimeHandle::current());
        let first = registry.put(finished_job(PathBuf::from("/nonexistent/a.zip")));

        let fresh = Handle::random();
        let mut candidates = vec![fresh, first].into_iter().rev();
        let second = registry.put_with(finished_job(PathBuf::from("/nonexistent/b.zip")), || {
            candidates.next().unwrap()
        });

        assert_eq!(second, fresh);
        assert_eq!(registry.get(first).unwrap().file(), PathBuf::from("/nonexistent/a.zip"));
        assert_eq!(registry.get(second).unwrap().file(), PathBuf::from("/nonexistent/b.zip"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_get_distinct_handles() {
        let registry = Registry::new(&config(Duration::from_secs(60)), &RuntimeHandle::current());

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.put(finished_job(PathBuf::from(format!("/nonexistent/{i}.zip"))))
                })
            })
            .collect();

        let mut handles = HashSet::new();
        for task in tasks {
            handles.insert(task.await.unwrap());
        }
        assert_eq!(handles.len(), 64);
        assert_eq!(registry.len(), 64);
    }

    #[tokio::test]
    async fn expiry_removes_entry_and_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("payload.zip");
        std::fs::write(&file, b"payload").unwrap();

        let registry = Registry::new(&config(Duration::from_millis(100)), &RuntimeHandle::current());
        let handle = registry.put(finished_job(file.clone()));
        assert!(registry.get(handle).is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.get(handle).is_none());

        wait_for_cleanup(&registry, 1).await;
        assert!(!file.exists());
        assert_eq!(registry.stats().evicted, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn expiry_cancels_unfinished_job() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("payload.zip");
        std::fs::write(&file, b"payload").unwrap();

        let registry = Registry::new(&config(Duration::from_millis(100)), &RuntimeHandle::current());
        let job = stuck_job(file.clone());
        registry.put(Arc::clone(&job));

        wait_for_cleanup(&registry, 1).await;
        let status = job.status();
        assert_eq!(status.state, State::Error);
        assert!(job.is_cancelled());
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn already_deleted_file_is_tolerated() {
        let registry = Registry::new(&config(Duration::from_millis(50)), &RuntimeHandle::current());
        registry.put(finished_job(PathBuf::from("/nonexistent/missing.zip")));

        wait_for_cleanup(&registry, 1).await;
        assert_eq!(registry.stats().evicted, 1);
    }
}
