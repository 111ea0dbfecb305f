use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use crate::cache::SqliteCache;
use crate::coordinator::{
    CompletionHook, DEFAULT_REFRESH_WINDOW_DAYS, MutationOutcome, RefreshReport, SyncCoordinator,
};
use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    DayProgress, ItemUpdate, NewItem, ProgressRecord, TrackedItem, validate_item,
};
use crate::remote::{DisconnectedRemote, RemoteStore};
use crate::repository::{DEFAULT_MIRROR_CAPACITY, Repository};
use crate::sink::ErrorSink;

/// Remote stores for both entity types.
///
/// Front ends inject their own client here; tests inject a fake.
#[derive(Clone)]
pub struct Remotes {
    pub items: Arc<dyn RemoteStore<TrackedItem>>,
    pub progress: Arc<dyn RemoteStore<ProgressRecord>>,
}

impl Remotes {
    /// Local-only operation.
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            items: Arc::new(DisconnectedRemote),
            progress: Arc::new(DisconnectedRemote),
        }
    }

    /// One client serving both entity types.
    pub fn shared<R>(remote: Arc<R>) -> Self
    where
        R: RemoteStore<TrackedItem> + RemoteStore<ProgressRecord> + 'static,
    {
        Self {
            items: remote.clone(),
            progress: remote,
        }
    }
}

#[derive(Clone)]
pub struct SyncOptions {
    pub refresh_window_days: u32,
    pub mirror_queue_capacity: usize,
    pub on_complete: Option<CompletionHook>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            refresh_window_days: DEFAULT_REFRESH_WINDOW_DAYS,
            mirror_queue_capacity: DEFAULT_MIRROR_CAPACITY,
            on_complete: None,
        }
    }
}

/// Front-end facade: habit CRUD plus the progress engine over one database.
///
/// Must be constructed inside a tokio runtime; each repository spawns its
/// mirror worker on it.
pub struct HabitService {
    user_id: String,
    items: Arc<Repository<TrackedItem>>,
    progress: Arc<Repository<ProgressRecord>>,
    coordinator: SyncCoordinator,
    sink: ErrorSink,
}

impl HabitService {
    pub fn open(db_path: &Path, remotes: Remotes, options: SyncOptions) -> anyhow::Result<Self> {
        Self::with_database(Database::open(db_path)?, remotes, options)
    }

    pub fn new_in_memory(remotes: Remotes, options: SyncOptions) -> anyhow::Result<Self> {
        Self::with_database(Database::open_in_memory()?, remotes, options)
    }

    fn with_database(db: Database, remotes: Remotes, options: SyncOptions) -> anyhow::Result<Self> {
        let user_id = db.get_or_create_user_id()?;
        let cache = Arc::new(SqliteCache::new(Arc::new(Mutex::new(db))));
        let sink = ErrorSink::new();

        let items: Arc<Repository<TrackedItem>> = Arc::new(Repository::new(
            cache.clone(),
            remotes.items,
            sink.clone(),
            &user_id,
            options.mirror_queue_capacity,
        ));
        let progress: Arc<Repository<ProgressRecord>> = Arc::new(Repository::new(
            cache,
            remotes.progress,
            sink.clone(),
            &user_id,
            options.mirror_queue_capacity,
        ));

        let mut coordinator =
            SyncCoordinator::new(items.clone(), progress.clone(), sink.clone())
                .with_refresh_window(options.refresh_window_days);
        if let Some(hook) = options.on_complete {
            coordinator = coordinator.with_completion_hook(hook);
        }

        Ok(Self {
            user_id,
            items,
            progress,
            coordinator,
            sink,
        })
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.sink.current()
    }

    #[must_use]
    pub fn sink(&self) -> &ErrorSink {
        &self.sink
    }

    // --- Habits ---

    /// Cache-first list of every habit; a detached refresh follows.
    pub fn list_items(&self) -> SyncResult<Vec<TrackedItem>> {
        self.items.fetch_all()
    }

    /// Habits inside their validity window on `day`.
    pub fn active_items(&self, day: NaiveDate) -> SyncResult<Vec<TrackedItem>> {
        Ok(self
            .items
            .cached()?
            .into_iter()
            .filter(|i| i.is_active_on(day))
            .collect())
    }

    /// Look a habit up by id, id prefix, or case-insensitive name.
    pub fn find_item(&self, query: &str) -> SyncResult<TrackedItem> {
        let items = self.items.cached()?;
        if let Ok(id) = Uuid::parse_str(query) {
            return items
                .into_iter()
                .find(|i| i.id == id)
                .ok_or_else(|| SyncError::Invalid(format!("No habit with id {id}")));
        }

        let query_lower = query.trim().to_lowercase();
        if let Some(item) = items.iter().find(|i| i.name.to_lowercase() == query_lower) {
            return Ok(item.clone());
        }

        let matches: Vec<&TrackedItem> = items
            .iter()
            .filter(|i| i.id.to_string().starts_with(&query_lower))
            .collect();
        match matches.as_slice() {
            [item] => Ok((*item).clone()),
            [] => Err(SyncError::Invalid(format!("No habit named '{query}'"))),
            _ => Err(SyncError::Invalid(format!(
                "'{query}' matches {} habits; use more of the id",
                matches.len()
            ))),
        }
    }

    /// Create a habit. The remote write is awaited and its failure returned.
    pub async fn create_item(&self, new: NewItem) -> SyncResult<TrackedItem> {
        let item = TrackedItem::new(&self.user_id, new);
        validate_item(&item).map_err(|e| SyncError::Invalid(e.to_string()))?;
        self.items.add_confirmed(&item).await?;
        Ok(item)
    }

    pub fn update_item(&self, item: &TrackedItem, update: &ItemUpdate) -> SyncResult<TrackedItem> {
        if update.is_empty() {
            return Err(SyncError::Invalid("Nothing to update".to_string()));
        }
        let mut item = item.clone();
        item.apply(update);
        validate_item(&item).map_err(|e| SyncError::Invalid(e.to_string()))?;
        self.items.update(&item)?;
        Ok(item)
    }

    pub async fn delete_item(&self, item: &TrackedItem) -> SyncResult<()> {
        self.coordinator.delete_item(item).await
    }

    // --- Progress ---

    pub fn increment<Tz: TimeZone>(
        &self,
        item: &TrackedItem,
        instant: &DateTime<Tz>,
    ) -> SyncResult<MutationOutcome> {
        self.coordinator.increment_progress(item, instant)
    }

    pub fn decrement<Tz: TimeZone>(
        &self,
        item: &TrackedItem,
        instant: &DateTime<Tz>,
    ) -> SyncResult<MutationOutcome> {
        self.coordinator.decrement_progress(item, instant)
    }

    /// Seed in-memory progress from the cache. Call before reading progress.
    pub fn load_cached(&self) -> SyncResult<usize> {
        self.coordinator.load_cached()
    }

    /// Pull the trailing window for every cached habit and merge it.
    pub async fn refresh<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> SyncResult<RefreshReport> {
        let items = self.items.cached()?;
        self.coordinator.refresh(&items, now).await
    }

    /// Progress of every habit active on `day`.
    pub fn day_progress(&self, day: NaiveDate) -> SyncResult<Vec<DayProgress>> {
        Ok(self
            .active_items(day)?
            .into_iter()
            .map(|item| DayProgress {
                item_id: item.id,
                count: self.coordinator.progress_on(&item, day),
                goal: self.coordinator.goal_on(&item, day),
                scheduled: item.is_scheduled_on(day),
                day,
                name: item.name,
                unit: item.unit,
            })
            .collect())
    }

    /// In-memory history of one habit within `[from, to]`, oldest first.
    #[must_use]
    pub fn history(&self, item: &TrackedItem, from: NaiveDate, to: NaiveDate) -> Vec<ProgressRecord> {
        self.coordinator
            .history_for(item.id)
            .range(from..=to)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Cached records of one habit, independent of what has been loaded.
    pub fn cached_history(
        &self,
        item: &TrackedItem,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SyncResult<Vec<ProgressRecord>> {
        self.progress.cached_range(item.id, from, to)
    }

    /// Wait for every pending remote write.
    pub async fn flush(&self) {
        self.coordinator.flush().await;
    }

    #[must_use]
    pub fn today() -> NaiveDate {
        crate::daykey::normalize(&Utc::now())
    }
}
