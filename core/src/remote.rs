//! Contract of the remote authoritative store.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RemoteError;
use crate::models::{ConflictKey, Entity, ProgressRecord, TrackedItem};

/// Row filter for [`RemoteStore::fetch`]. Day bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFilter {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NaiveDate>,
}

impl RemoteFilter {
    #[must_use]
    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn item(mut self, item_id: Uuid) -> Self {
        self.item_id = Some(item_id);
        self
    }

    #[must_use]
    pub fn days(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    #[must_use]
    pub fn matches_item(&self, item: &TrackedItem) -> bool {
        item.user_id == self.user_id && self.item_id.is_none_or(|id| id == item.id)
    }

    #[must_use]
    pub fn matches_progress(&self, record: &ProgressRecord) -> bool {
        record.user_id == self.user_id
            && self.item_id.is_none_or(|id| id == record.item_id)
            && self.from.is_none_or(|from| record.day >= from)
            && self.to.is_none_or(|to| record.day <= to)
    }
}

/// Network client for one entity type.
///
/// Every call may fail. `upsert` must be idempotent on `conflict`: upserting
/// the same logical record twice leaves one row.
#[async_trait]
pub trait RemoteStore<E: Entity>: Send + Sync {
    async fn fetch(&self, filter: &RemoteFilter) -> Result<Vec<E>, RemoteError>;

    async fn upsert(&self, entity: &E, conflict: ConflictKey) -> Result<(), RemoteError>;

    async fn delete(&self, entity: &E) -> Result<(), RemoteError>;
}

/// Store used when no remote is configured. Every call fails with
/// [`RemoteError::NotConfigured`], which the engine never reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectedRemote;

#[async_trait]
impl<E: Entity> RemoteStore<E> for DisconnectedRemote {
    async fn fetch(&self, _filter: &RemoteFilter) -> Result<Vec<E>, RemoteError> {
        Err(RemoteError::NotConfigured)
    }

    async fn upsert(&self, _entity: &E, _conflict: ConflictKey) -> Result<(), RemoteError> {
        Err(RemoteError::NotConfigured)
    }

    async fn delete(&self, _entity: &E) -> Result<(), RemoteError> {
        Err(RemoteError::NotConfigured)
    }
}
