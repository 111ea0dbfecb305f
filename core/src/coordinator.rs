//! Optimistic progress mutations and refresh reconciliation.
//!
//! The coordinator owns the day-keyed progress history plus two guard sets:
//! `updating` (a mutation for the key is in flight; overlapping ones are
//! dropped) and `dirty` (the in-memory value reflects a local write the
//! remote store has not yet echoed back). Deleted item ids are tombstoned so
//! a mutation or refresh that overlaps the delete cannot bring their progress
//! back. All of it lives under one lock, which is never held across a storage
//! call or an `.await`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::daykey::{DayKey, normalize};
use crate::error::SyncResult;
use crate::models::{ProgressRecord, TrackedItem};
use crate::repository::Repository;
use crate::sink::ErrorSink;

pub const DEFAULT_REFRESH_WINDOW_DAYS: u32 = 90;

/// Invoked once when a day's count reaches its goal.
pub type CompletionHook = Arc<dyn Fn(&TrackedItem, &ProgressRecord) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied {
        record: ProgressRecord,
        goal_reached: bool,
    },
    /// Another mutation for the same key was in flight; this one was dropped.
    Busy,
    /// Already at the bound (goal for increments, zero for decrements).
    Unchanged { count: u32 },
    /// The item was deleted before the mutation could land.
    Discarded,
}

impl MutationOutcome {
    #[must_use]
    pub fn count(&self) -> Option<u32> {
        match self {
            Self::Applied { record, .. } => Some(record.count),
            Self::Unchanged { count } => Some(*count),
            Self::Busy | Self::Discarded => None,
        }
    }
}

/// Result of merging one item's remote records.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Records now in history; the caller persists them to the cache.
    pub accepted: Vec<ProgressRecord>,
    /// Dirty keys whose stale remote value was discarded.
    pub kept_local: usize,
    /// Dirty keys the remote store confirmed.
    pub confirmed: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RefreshReport {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub items_refreshed: usize,
    pub items_failed: usize,
    pub records_accepted: usize,
    pub records_kept_local: usize,
    pub keys_confirmed: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Step {
    Up,
    Down,
}

#[derive(Default)]
struct State {
    history: HashMap<Uuid, BTreeMap<NaiveDate, ProgressRecord>>,
    updating: HashSet<DayKey>,
    dirty: HashSet<DayKey>,
    deleted: HashSet<Uuid>,
}

impl State {
    fn record(&self, key: DayKey) -> Option<&ProgressRecord> {
        self.history.get(&key.item_id)?.get(&key.day)
    }
}

pub struct SyncCoordinator {
    items: Arc<Repository<TrackedItem>>,
    progress: Arc<Repository<ProgressRecord>>,
    sink: ErrorSink,
    on_complete: Option<CompletionHook>,
    refresh_window_days: u32,
    state: Mutex<State>,
}

impl SyncCoordinator {
    pub fn new(
        items: Arc<Repository<TrackedItem>>,
        progress: Arc<Repository<ProgressRecord>>,
        sink: ErrorSink,
    ) -> Self {
        Self {
            items,
            progress,
            sink,
            on_complete: None,
            refresh_window_days: DEFAULT_REFRESH_WINDOW_DAYS,
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub fn with_completion_hook(mut self, hook: CompletionHook) -> Self {
        self.on_complete = Some(hook);
        self
    }

    #[must_use]
    pub fn with_refresh_window(mut self, days: u32) -> Self {
        self.refresh_window_days = days.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn sink(&self) -> &ErrorSink {
        &self.sink
    }

    // --- Mutations ---

    pub fn increment_progress<Tz: TimeZone>(
        &self,
        item: &TrackedItem,
        instant: &DateTime<Tz>,
    ) -> SyncResult<MutationOutcome> {
        self.mutate(item, normalize(instant), Step::Up)
    }

    pub fn decrement_progress<Tz: TimeZone>(
        &self,
        item: &TrackedItem,
        instant: &DateTime<Tz>,
    ) -> SyncResult<MutationOutcome> {
        self.mutate(item, normalize(instant), Step::Down)
    }

    fn mutate(&self, item: &TrackedItem, day: NaiveDate, step: Step) -> SyncResult<MutationOutcome> {
        let key = DayKey::new(item.id, day);

        let current = {
            let mut state = self.state();
            if state.deleted.contains(&item.id) {
                return Ok(MutationOutcome::Discarded);
            }
            if !state.updating.insert(key) {
                debug!(%key, "mutation dropped, key busy");
                return Ok(MutationOutcome::Busy);
            }
            state.record(key).cloned()
        };

        let (count, goal) = current
            .as_ref()
            .map_or((0, item.daily_goal), |r| (r.count, r.goal));
        let next = match step {
            Step::Up if count < goal => Some(count + 1),
            Step::Up => None,
            Step::Down => count.checked_sub(1),
        };
        let Some(next) = next else {
            self.state().updating.remove(&key);
            return Ok(MutationOutcome::Unchanged { count });
        };

        let mut record = current.unwrap_or_else(|| ProgressRecord::new(item, day, 0, goal));
        record.count = next;
        record.updated_at = Utc::now();

        // The lock is released here; `updating` keeps other callers off this key.
        if let Err(err) = self.progress.update(&record) {
            self.state().updating.remove(&key);
            return Err(err);
        }

        let deleted = {
            let mut state = self.state();
            let deleted = state.deleted.contains(&item.id);
            if deleted {
                state.updating.remove(&key);
            } else {
                state
                    .history
                    .entry(item.id)
                    .or_default()
                    .insert(day, record.clone());
                state.dirty.insert(key);
            }
            deleted
        };
        if deleted {
            // The delete ran while the write was in flight; undo it.
            debug!(%key, "item deleted mid-mutation, write discarded");
            self.progress.delete(&record)?;
            return Ok(MutationOutcome::Discarded);
        }

        let goal_reached = step == Step::Up && next == goal;
        if let Some(hook) = self.on_complete.as_ref().filter(|_| goal_reached) {
            hook(item, &record);
        }

        self.state().updating.remove(&key);
        debug!(%key, count = next, goal, "progress updated");
        Ok(MutationOutcome::Applied {
            record,
            goal_reached,
        })
    }

    // --- Reads ---

    #[must_use]
    pub fn progress<Tz: TimeZone>(&self, item: &TrackedItem, instant: &DateTime<Tz>) -> u32 {
        self.progress_on(item, normalize(instant))
    }

    #[must_use]
    pub fn progress_on(&self, item: &TrackedItem, day: NaiveDate) -> u32 {
        self.state()
            .record(DayKey::new(item.id, day))
            .map_or(0, |r| r.count)
    }

    /// Goal snapshot of the day's record, else the item's current goal.
    #[must_use]
    pub fn goal<Tz: TimeZone>(&self, item: &TrackedItem, instant: &DateTime<Tz>) -> u32 {
        self.goal_on(item, normalize(instant))
    }

    #[must_use]
    pub fn goal_on(&self, item: &TrackedItem, day: NaiveDate) -> u32 {
        self.state()
            .record(DayKey::new(item.id, day))
            .map_or(item.daily_goal, |r| r.goal)
    }

    #[must_use]
    pub fn history_for(&self, item_id: Uuid) -> BTreeMap<NaiveDate, ProgressRecord> {
        self.state()
            .history
            .get(&item_id)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_dirty(&self, key: DayKey) -> bool {
        self.state().dirty.contains(&key)
    }

    #[must_use]
    pub fn is_updating(&self, key: DayKey) -> bool {
        self.state().updating.contains(&key)
    }

    #[must_use]
    pub fn is_deleted(&self, item_id: Uuid) -> bool {
        self.state().deleted.contains(&item_id)
    }

    // --- Reconciliation ---

    /// Seed history from the local cache. Keys with a pending or in-flight
    /// local write keep their in-memory value.
    pub fn load_cached(&self) -> SyncResult<usize> {
        let records = self.progress.cached()?;
        let mut state = self.state();
        let mut loaded = 0;
        for record in records {
            let key = record.key();
            if state.dirty.contains(&key)
                || state.updating.contains(&key)
                || state.deleted.contains(&record.item_id)
            {
                continue;
            }
            state
                .history
                .entry(record.item_id)
                .or_default()
                .insert(record.day, record);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Merge remote records for one item, key by key.
    ///
    /// A dirty key accepts the remote record only when it carries the same
    /// `(count, goal)` as the local one, which also clears the dirty flag.
    /// Any other remote value for a dirty key is stale and discarded.
    pub fn merge_remote_refresh(
        &self,
        item_id: Uuid,
        records: Vec<ProgressRecord>,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut state = self.state();
        if state.deleted.contains(&item_id) {
            debug!(%item_id, "merge skipped, item deleted");
            return outcome;
        }
        for remote in records {
            if remote.item_id != item_id {
                debug!(%item_id, other = %remote.item_id, "ignoring record of another item");
                continue;
            }
            let key = remote.key();
            if state.dirty.contains(&key) {
                let confirmed = state
                    .record(key)
                    .is_none_or(|local| local.same_progress(&remote));
                if !confirmed {
                    debug!(%key, remote = remote.count, "stale remote value discarded");
                    outcome.kept_local += 1;
                    continue;
                }
                state.dirty.remove(&key);
                outcome.confirmed += 1;
            }
            state
                .history
                .entry(item_id)
                .or_default()
                .insert(remote.day, remote.clone());
            outcome.accepted.push(remote);
        }
        outcome
    }

    /// Pull the trailing window of progress for every item active in it.
    ///
    /// Remote failures are recorded in the sink and the remaining items are
    /// still refreshed. Only a local cache failure aborts.
    pub async fn refresh<Tz: TimeZone>(
        &self,
        items: &[TrackedItem],
        now: &DateTime<Tz>,
    ) -> SyncResult<RefreshReport> {
        let to = normalize(now);
        let from = to
            .checked_sub_days(Days::new(u64::from(self.refresh_window_days)))
            .unwrap_or(NaiveDate::MIN);
        let mut report = RefreshReport {
            from: Some(from),
            to: Some(to),
            ..RefreshReport::default()
        };

        for item in items.iter().filter(|i| i.overlaps(from, to)) {
            let records = match self.progress.fetch_range(item.id, from, to).await {
                Ok(records) => records,
                Err(err) => {
                    self.sink.record(&format!("refresh {}", item.name), &err);
                    report.items_failed += 1;
                    continue;
                }
            };
            let merged = self.merge_remote_refresh(item.id, records);
            for record in &merged.accepted {
                self.progress.store_local(record)?;
            }
            if self.is_deleted(item.id) {
                // Deleted between the merge and the cache write
                for record in &merged.accepted {
                    self.progress.delete(record)?;
                }
                continue;
            }
            report.items_refreshed += 1;
            report.records_accepted += merged.accepted.len();
            report.records_kept_local += merged.kept_local;
            report.keys_confirmed += merged.confirmed;
        }

        info!(
            refreshed = report.items_refreshed,
            failed = report.items_failed,
            accepted = report.records_accepted,
            kept_local = report.records_kept_local,
            "progress refresh finished"
        );
        Ok(report)
    }

    /// Delete an item and everything recorded against it.
    ///
    /// Progress deletes are mirrored best-effort; the item delete itself goes
    /// through the confirmed path so a remote failure reaches the caller.
    pub async fn delete_item(&self, item: &TrackedItem) -> SyncResult<()> {
        {
            let mut state = self.state();
            state.deleted.insert(item.id);
            state.history.remove(&item.id);
            state.dirty.retain(|k| k.item_id != item.id);
        }
        let records: Vec<ProgressRecord> = self
            .progress
            .cached()?
            .into_iter()
            .filter(|r| r.item_id == item.id)
            .collect();
        for record in &records {
            self.progress.delete(record)?;
        }
        info!(item = %item.id, records = records.len(), "deleting item");
        self.items.delete_confirmed(item).await
    }

    /// Wait for both repositories' pending remote writes.
    pub async fn flush(&self) {
        self.items.flush().await;
        self.progress.flush().await;
    }
}
