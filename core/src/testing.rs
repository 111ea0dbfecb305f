//! In-memory collaborators for engine tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::cache::LocalCache;
use crate::error::RemoteError;
use crate::models::{ConflictKey, Entity, NewItem, ProgressRecord, Recurrence, TrackedItem};
use crate::remote::{RemoteFilter, RemoteStore};

pub fn habit(name: &str, goal: u32) -> TrackedItem {
    TrackedItem::new(
        "user-1",
        NewItem {
            name: name.to_string(),
            daily_goal: goal,
            recurrence: Recurrence::Daily,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: None,
            icon: None,
            unit: None,
            tag: None,
        },
    )
}

/// Remote store fake holding both entity types, with latency and failure
/// injection.
#[derive(Default)]
pub struct MemoryRemote {
    pub items: Mutex<Vec<TrackedItem>>,
    pub progress: Mutex<Vec<ProgressRecord>>,
    delay_ms: AtomicUsize,
    failing: AtomicBool,
    pub upserts: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn progress_rows(&self) -> Vec<ProgressRecord> {
        self.progress.lock().unwrap().clone()
    }

    async fn call(&self) -> Result<(), RemoteError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore<TrackedItem> for MemoryRemote {
    async fn fetch(&self, filter: &RemoteFilter) -> Result<Vec<TrackedItem>, RemoteError> {
        self.call().await?;
        let items = self.items.lock().unwrap();
        Ok(items.iter().filter(|i| filter.matches_item(i)).cloned().collect())
    }

    async fn upsert(&self, item: &TrackedItem, conflict: ConflictKey) -> Result<(), RemoteError> {
        assert_eq!(conflict, TrackedItem::CONFLICT_KEY);
        self.call().await?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let mut items = self.items.lock().unwrap();
        items.retain(|i| i.id != item.id);
        items.push(item.clone());
        Ok(())
    }

    async fn delete(&self, item: &TrackedItem) -> Result<(), RemoteError> {
        self.call().await?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.items.lock().unwrap().retain(|i| i.id != item.id);
        self.progress
            .lock()
            .unwrap()
            .retain(|r| r.item_id != item.id);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore<ProgressRecord> for MemoryRemote {
    async fn fetch(&self, filter: &RemoteFilter) -> Result<Vec<ProgressRecord>, RemoteError> {
        self.call().await?;
        let rows = self.progress.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|r| filter.matches_progress(r))
            .cloned()
            .collect())
    }

    async fn upsert(
        &self,
        record: &ProgressRecord,
        conflict: ConflictKey,
    ) -> Result<(), RemoteError> {
        assert_eq!(conflict, ConflictKey::UserItemDay);
        self.call().await?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.progress.lock().unwrap();
        rows.retain(|r| {
            !(r.user_id == record.user_id && r.item_id == record.item_id && r.day == record.day)
        });
        rows.push(record.clone());
        Ok(())
    }

    async fn delete(&self, record: &ProgressRecord) -> Result<(), RemoteError> {
        self.call().await?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.progress.lock().unwrap().retain(|r| r.id != record.id);
        Ok(())
    }
}

/// Vec-backed cache whose writes can be paused or made to fail.
pub struct GatedCache<E> {
    rows: Mutex<Vec<E>>,
    gate: Mutex<Option<Gate>>,
    failing: AtomicBool,
}

struct Gate {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

/// Test-side handle of a paused [`GatedCache`] write.
pub struct GateHandle {
    pub entered: mpsc::Receiver<()>,
    pub release: mpsc::Sender<()>,
}

impl<E: Entity> GatedCache<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            failing: AtomicBool::new(false),
        })
    }

    /// Make the next write block until the handle releases it.
    pub fn pause_next_write(&self) -> GateHandle {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        GateHandle {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn wait_gate(&self) {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.send(()).unwrap();
            gate.release.recv().unwrap();
        }
    }
}

impl<E: Entity> LocalCache<E> for GatedCache<E> {
    fn fetch_all(&self) -> Result<Vec<E>> {
        Ok(self.rows.lock().unwrap().clone())
    }

    fn save(&self, entity: &E) -> Result<()> {
        self.wait_gate();
        if self.failing.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        let mut rows = self.rows.lock().unwrap();
        rows.retain(|r| r.id() != entity.id());
        rows.push(entity.clone());
        Ok(())
    }

    fn delete(&self, entity: &E) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.rows.lock().unwrap().retain(|r| r.id() != entity.id());
        Ok(())
    }
}
