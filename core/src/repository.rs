//! Cache-first reads and write-through writes for one entity type.
//!
//! Local writes are synchronous and their failures propagate. Remote writes
//! are handed to a mirror worker over a bounded channel and never block the
//! caller; their failures go to the [`ErrorSink`].

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::LocalCache;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::models::{Entity, ProgressRecord};
use crate::remote::{RemoteFilter, RemoteStore};
use crate::sink::ErrorSink;

pub const DEFAULT_MIRROR_CAPACITY: usize = 64;

enum MirrorJob<E> {
    Upsert(E),
    Delete(E),
    /// Pull remote rows into the cache.
    Refresh(RemoteFilter),
    Flush(oneshot::Sender<()>),
}

pub struct Repository<E: Entity> {
    cache: Arc<dyn LocalCache<E>>,
    remote: Arc<dyn RemoteStore<E>>,
    sink: ErrorSink,
    user_id: String,
    jobs: mpsc::Sender<MirrorJob<E>>,
}

impl<E: Entity> Repository<E> {
    /// Build the repository and spawn its mirror worker on the current
    /// tokio runtime. The worker exits when the repository is dropped.
    pub fn new(
        cache: Arc<dyn LocalCache<E>>,
        remote: Arc<dyn RemoteStore<E>>,
        sink: ErrorSink,
        user_id: &str,
        capacity: usize,
    ) -> Self {
        let (jobs, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_mirror(
            rx,
            Arc::clone(&cache),
            Arc::clone(&remote),
            sink.clone(),
        ));
        Self {
            cache,
            remote,
            sink,
            user_id: user_id.to_string(),
            jobs,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Cache snapshot, returned without waiting on the network. A detached
    /// refresh then writes the remote rows into the cache.
    ///
    /// The refresh saves every remote row as-is. For progress that skips the
    /// coordinator's dirty check, so a newer local count can be replaced in
    /// the cache by an older remote one. Progress reads go through
    /// `SyncCoordinator::refresh` or `fetch_range` instead.
    pub fn fetch_all(&self) -> SyncResult<Vec<E>> {
        let snapshot = self.cached()?;
        self.submit(MirrorJob::Refresh(RemoteFilter::user(&self.user_id)));
        Ok(snapshot)
    }

    pub fn cached(&self) -> SyncResult<Vec<E>> {
        self.cache.fetch_all().map_err(SyncError::Cache)
    }

    /// Cache-only write, no mirror.
    pub fn store_local(&self, entity: &E) -> SyncResult<()> {
        self.cache.save(entity).map_err(SyncError::Cache)
    }

    pub fn add(&self, entity: &E) -> SyncResult<()> {
        self.update(entity)
    }

    pub fn update(&self, entity: &E) -> SyncResult<()> {
        self.store_local(entity)?;
        self.submit(MirrorJob::Upsert(entity.clone()));
        Ok(())
    }

    pub fn delete(&self, entity: &E) -> SyncResult<()> {
        self.cache.delete(entity).map_err(SyncError::Cache)?;
        self.submit(MirrorJob::Delete(entity.clone()));
        Ok(())
    }

    /// Create on behalf of the user: the remote result is awaited and a
    /// reportable failure is returned instead of swallowed.
    pub async fn add_confirmed(&self, entity: &E) -> SyncResult<()> {
        self.store_local(entity)?;
        confirm(self.remote.upsert(entity, E::CONFLICT_KEY).await, "upsert", E::KIND)
    }

    pub async fn delete_confirmed(&self, entity: &E) -> SyncResult<()> {
        self.cache.delete(entity).map_err(SyncError::Cache)?;
        confirm(self.remote.delete(entity).await, "delete", E::KIND)
    }

    /// Wait until every mirror job submitted before this call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(MirrorJob::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn submit(&self, job: MirrorJob<E>) {
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.sink
                    .record_message(format!("{} sync queue is full; change not mirrored", E::KIND));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(kind = E::KIND, "mirror worker stopped; change not mirrored");
            }
        }
    }
}

impl Repository<ProgressRecord> {
    /// Remote records of one item within `[from, to]`.
    pub async fn fetch_range(
        &self,
        item_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProgressRecord>, RemoteError> {
        let filter = RemoteFilter::user(&self.user_id)
            .item(item_id)
            .days(from, to);
        self.remote.fetch(&filter).await
    }

    /// Cached records of one item within `[from, to]`, oldest first.
    pub fn cached_range(
        &self,
        item_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SyncResult<Vec<ProgressRecord>> {
        let mut records: Vec<ProgressRecord> = self
            .cached()?
            .into_iter()
            .filter(|r| r.item_id == item_id && r.day >= from && r.day <= to)
            .collect();
        records.sort_by_key(|r| r.day);
        Ok(records)
    }
}

fn confirm(result: Result<(), RemoteError>, op: &str, kind: &str) -> SyncResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if !err.is_reportable() => {
            debug!(kind, op, "remote skipped: {err}");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn run_mirror<E: Entity>(
    mut rx: mpsc::Receiver<MirrorJob<E>>,
    cache: Arc<dyn LocalCache<E>>,
    remote: Arc<dyn RemoteStore<E>>,
    sink: ErrorSink,
) {
    while let Some(job) = rx.recv().await {
        match job {
            MirrorJob::Upsert(entity) => {
                match remote.upsert(&entity, E::CONFLICT_KEY).await {
                    Ok(()) => debug!(kind = E::KIND, id = %entity.id(), "mirrored upsert"),
                    Err(err) => sink.record(&format!("sync {}", E::KIND), &err),
                }
            }
            MirrorJob::Delete(entity) => match remote.delete(&entity).await {
                Ok(()) => debug!(kind = E::KIND, id = %entity.id(), "mirrored delete"),
                Err(err) => sink.record(&format!("delete {}", E::KIND), &err),
            },
            MirrorJob::Refresh(filter) => match remote.fetch(&filter).await {
                Ok(rows) => {
                    let mut saved = 0usize;
                    for row in &rows {
                        match cache.save(row) {
                            Ok(()) => saved += 1,
                            Err(err) => warn!(kind = E::KIND, id = %row.id(), "cache refresh failed: {err:#}"),
                        }
                    }
                    debug!(kind = E::KIND, saved, "cache refreshed from remote");
                }
                Err(err) => sink.record(&format!("refresh {}", E::KIND), &err),
            },
            MirrorJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(kind = E::KIND, "mirror worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::models::{ProgressRecord, TrackedItem};
    use crate::remote::DisconnectedRemote;
    use crate::testing::{GatedCache, MemoryRemote, habit};

    fn items_repo(
        cache: &Arc<GatedCache<TrackedItem>>,
        remote: &Arc<MemoryRemote>,
        sink: &ErrorSink,
    ) -> Repository<TrackedItem> {
        Repository::new(
            cache.clone(),
            remote.clone(),
            sink.clone(),
            "user-1",
            DEFAULT_MIRROR_CAPACITY,
        )
    }

    #[tokio::test]
    async fn test_fetch_all_returns_cache_without_waiting_for_remote() {
        let cache = GatedCache::<TrackedItem>::new();
        let remote = MemoryRemote::new();
        let sink = ErrorSink::new();
        let repo = items_repo(&cache, &remote, &sink);

        let local = habit("Local", 1);
        repo.store_local(&local).unwrap();
        remote.items.lock().unwrap().push(habit("Remote", 1));
        remote.set_delay(Duration::from_millis(500));

        let started = Instant::now();
        let snapshot = repo.fetch_all().unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(snapshot, vec![local.clone()]);

        repo.flush().await;
        let names: Vec<String> = repo.cached().unwrap().into_iter().map(|i| i.name).collect();
        assert!(names.contains(&"Local".to_string()));
        assert!(names.contains(&"Remote".to_string()));
    }

    #[tokio::test]
    async fn test_progress_fetch_all_saves_remote_rows_unchecked() {
        let cache = GatedCache::<ProgressRecord>::new();
        let remote = MemoryRemote::new();
        let sink = ErrorSink::new();
        let repo: Repository<ProgressRecord> = Repository::new(
            cache.clone(),
            remote.clone(),
            sink.clone(),
            "user-1",
            DEFAULT_MIRROR_CAPACITY,
        );
        let item = habit("Water", 5);
        let day = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();

        // Local count 3 never reached the remote, which still holds 1
        let local = ProgressRecord::new(&item, day, 3, 5);
        repo.store_local(&local).unwrap();
        let mut older = local.clone();
        older.count = 1;
        remote.progress.lock().unwrap().push(older);

        assert_eq!(repo.fetch_all().unwrap(), vec![local]);
        repo.flush().await;
        let cached = repo.cached().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].count, 1);
    }

    #[tokio::test]
    async fn test_update_writes_cache_then_mirrors() {
        let cache = GatedCache::<TrackedItem>::new();
        let remote = MemoryRemote::new();
        let sink = ErrorSink::new();
        let repo = items_repo(&cache, &remote, &sink);

        let item = habit("Read", 2);
        repo.add(&item).unwrap();
        assert_eq!(repo.cached().unwrap(), vec![item.clone()]);

        repo.flush().await;
        assert_eq!(*remote.items.lock().unwrap(), vec![item]);
        assert!(sink.current().is_none());
    }

    #[tokio::test]
    async fn test_remote_failure_is_swallowed_and_recorded() {
        let cache = GatedCache::<TrackedItem>::new();
        let remote = MemoryRemote::new();
        let sink = ErrorSink::new();
        let repo = items_repo(&cache, &remote, &sink);
        remote.set_failing(true);

        let item = habit("Read", 2);
        repo.update(&item).unwrap();
        repo.flush().await;

        assert_eq!(repo.cached().unwrap(), vec![item]);
        let message = sink.current().unwrap();
        assert!(message.contains("connection refused"), "{message}");
    }

    #[tokio::test]
    async fn test_local_failure_propagates_and_skips_mirror() {
        let cache = GatedCache::<TrackedItem>::new();
        let remote = MemoryRemote::new();
        let sink = ErrorSink::new();
        let repo = items_repo(&cache, &remote, &sink);
        cache.set_failing(true);

        let err = repo.update(&habit("Read", 2)).unwrap_err();
        assert!(matches!(err, SyncError::Cache(_)));

        repo.flush().await;
        assert!(remote.items.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_mirrored() {
        let cache = GatedCache::<TrackedItem>::new();
        let remote = MemoryRemote::new();
        let sink = ErrorSink::new();
        let repo = items_repo(&cache, &remote, &sink);

        let item = habit("Read", 2);
        repo.add(&item).unwrap();
        repo.delete(&item).unwrap();
        repo.flush().await;

        assert!(repo.cached().unwrap().is_empty());
        assert!(remote.items.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_paths_surface_remote_errors() {
        let cache = GatedCache::<TrackedItem>::new();
        let remote = MemoryRemote::new();
        let sink = ErrorSink::new();
        let repo = items_repo(&cache, &remote, &sink);
        remote.set_failing(true);

        let item = habit("Read", 2);
        let err = repo.add_confirmed(&item).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::Network(_))));
        // Local write still happened
        assert_eq!(repo.cached().unwrap(), vec![item.clone()]);

        assert!(repo.delete_confirmed(&item).await.is_err());
        assert!(repo.cached().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_paths_succeed_without_remote() {
        let cache = GatedCache::<TrackedItem>::new();
        let sink = ErrorSink::new();
        let repo: Repository<TrackedItem> = Repository::new(
            cache.clone(),
            Arc::new(DisconnectedRemote),
            sink.clone(),
            "user-1",
            DEFAULT_MIRROR_CAPACITY,
        );

        let item = habit("Read", 2);
        repo.add_confirmed(&item).await.unwrap();
        repo.update(&item).unwrap();
        repo.flush().await;
        assert!(sink.current().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_reports() {
        let cache = GatedCache::<TrackedItem>::new();
        let remote = MemoryRemote::new();
        remote.set_delay(Duration::from_millis(200));
        let sink = ErrorSink::new();
        let repo: Repository<TrackedItem> =
            Repository::new(cache.clone(), remote.clone(), sink.clone(), "user-1", 1);

        for n in 0..8 {
            repo.update(&habit(&format!("h{n}"), 1)).unwrap();
        }
        assert_eq!(repo.cached().unwrap().len(), 8);
        assert!(sink.current().unwrap().contains("queue is full"));

        repo.flush().await;
        assert!(remote.items.lock().unwrap().len() < 8);
    }

    #[tokio::test]
    async fn test_fetch_range_filters_item_and_window() {
        let cache = GatedCache::<ProgressRecord>::new();
        let remote = MemoryRemote::new();
        let sink = ErrorSink::new();
        let repo: Repository<ProgressRecord> = Repository::new(
            cache.clone(),
            remote.clone(),
            sink.clone(),
            "user-1",
            DEFAULT_MIRROR_CAPACITY,
        );

        let item = habit("Water", 3);
        let other = habit("Read", 1);
        let day = |d| NaiveDate::from_ymd_opt(2024, 3, d).unwrap();
        {
            let mut rows = remote.progress.lock().unwrap();
            rows.push(ProgressRecord::new(&item, day(1), 1, 3));
            rows.push(ProgressRecord::new(&item, day(10), 2, 3));
            rows.push(ProgressRecord::new(&item, day(20), 3, 3));
            rows.push(ProgressRecord::new(&other, day(10), 1, 1));
        }

        let fetched = repo.fetch_range(item.id, day(5), day(20)).await.unwrap();
        let mut days: Vec<NaiveDate> = fetched.iter().map(|r| r.day).collect();
        days.sort();
        assert_eq!(days, vec![day(10), day(20)]);
    }
}
