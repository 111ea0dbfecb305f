use anyhow::{Result, bail};
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::daykey::DayKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Recurrence {
    Daily,
    /// Once a week, on the weekday of the habit's start date.
    Weekly,
    Custom { days: Vec<Weekday> },
}

impl Recurrence {
    /// Parse `daily`, `weekly`, or a comma-separated weekday list (`mon,wed,fri`).
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "weekdays" => Ok(Self::Custom {
                days: vec![
                    Weekday::Mon,
                    Weekday::Tue,
                    Weekday::Wed,
                    Weekday::Thu,
                    Weekday::Fri,
                ],
            }),
            "weekends" => Ok(Self::Custom {
                days: vec![Weekday::Sat, Weekday::Sun],
            }),
            other => {
                let mut days = Vec::new();
                for part in other.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let day: Weekday = part
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Invalid weekday '{part}'"))?;
                    if !days.contains(&day) {
                        days.push(day);
                    }
                }
                if days.is_empty() {
                    bail!("Invalid recurrence '{s}'. Use daily, weekly, or e.g. mon,wed,fri");
                }
                days.sort_by_key(Weekday::num_days_from_monday);
                Ok(Self::Custom { days })
            }
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Daily => "daily".to_string(),
            Self::Weekly => "weekly".to_string(),
            Self::Custom { days } => days
                .iter()
                .map(|d| d.to_string().to_lowercase())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// A habit definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub daily_goal: u32,
    pub recurrence: Recurrence,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedItem {
    #[must_use]
    pub fn new(user_id: &str, new: NewItem) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            name: new.name.trim().to_string(),
            daily_goal: new.daily_goal,
            recurrence: new.recurrence,
            start_date: new.start_date,
            end_date: new.end_date,
            icon: new.icon,
            unit: new.unit,
            tag: new.tag,
            created_at: now,
            updated_at: now,
        }
    }

    /// Inside the validity window. Items past their end date are soft-absent.
    #[must_use]
    pub fn is_active_on(&self, day: NaiveDate) -> bool {
        self.start_date <= day && self.end_date.is_none_or(|end| day <= end)
    }

    #[must_use]
    pub fn is_scheduled_on(&self, day: NaiveDate) -> bool {
        if !self.is_active_on(day) {
            return false;
        }
        match &self.recurrence {
            Recurrence::Daily => true,
            Recurrence::Weekly => day.weekday() == self.start_date.weekday(),
            Recurrence::Custom { days } => days.contains(&day.weekday()),
        }
    }

    /// Whether any part of `[from, to]` overlaps the validity window.
    #[must_use]
    pub fn overlaps(&self, from: NaiveDate, to: NaiveDate) -> bool {
        self.start_date <= to && self.end_date.is_none_or(|end| from <= end)
    }

    pub fn apply(&mut self, update: &ItemUpdate) {
        if let Some(ref name) = update.name {
            self.name = name.trim().to_string();
        }
        if let Some(goal) = update.daily_goal {
            self.daily_goal = goal;
        }
        if let Some(ref recurrence) = update.recurrence {
            self.recurrence = recurrence.clone();
        }
        if let Some(start) = update.start_date {
            self.start_date = start;
        }
        if let Some(end) = update.end_date {
            self.end_date = end;
        }
        if let Some(ref icon) = update.icon {
            self.icon.clone_from(icon);
        }
        if let Some(ref unit) = update.unit {
            self.unit.clone_from(unit);
        }
        if let Some(ref tag) = update.tag {
            self.tag.clone_from(tag);
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub name: String,
    pub daily_goal: u32,
    pub recurrence: Recurrence,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub icon: Option<String>,
    pub unit: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Default)]
#[allow(clippy::option_option)]
pub struct ItemUpdate {
    pub name: Option<String>,
    pub daily_goal: Option<u32>,
    pub recurrence: Option<Recurrence>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<Option<NaiveDate>>,
    pub icon: Option<Option<String>>,
    pub unit: Option<Option<String>>,
    pub tag: Option<Option<String>>,
}

impl ItemUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.daily_goal.is_none()
            && self.recurrence.is_none()
            && self.start_date.is_none()
            && self.end_date.is_none()
            && self.icon.is_none()
            && self.unit.is_none()
            && self.tag.is_none()
    }
}

pub fn validate_item(item: &TrackedItem) -> Result<()> {
    if item.name.trim().is_empty() {
        bail!("Habit name must not be empty");
    }
    if item.daily_goal == 0 {
        bail!("Daily goal must be at least 1");
    }
    if let Some(end) = item.end_date {
        if end < item.start_date {
            bail!(
                "End date {end} is before start date {}",
                item.start_date
            );
        }
    }
    if let Recurrence::Custom { days } = &item.recurrence {
        if days.is_empty() {
            bail!("Custom recurrence needs at least one weekday");
        }
    }
    Ok(())
}

/// Count achieved for one item on one UTC day.
///
/// `goal` is a snapshot of the item's goal when the record was written; editing
/// the item later leaves existing records alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: Uuid,
    pub user_id: String,
    pub item_id: Uuid,
    pub day: NaiveDate,
    pub count: u32,
    pub goal: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    #[must_use]
    pub fn new(item: &TrackedItem, day: NaiveDate, count: u32, goal: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: item.user_id.clone(),
            item_id: item.id,
            day,
            count,
            goal,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn key(&self) -> DayKey {
        DayKey::new(self.item_id, self.day)
    }

    /// Same observable progress, ignoring ids and timestamps.
    #[must_use]
    pub fn same_progress(&self, other: &Self) -> bool {
        self.count == other.count && self.goal == other.goal
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.count >= self.goal
    }
}

/// Column set a remote upsert resolves conflicts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKey {
    Id,
    UserItemDay,
}

impl ConflictKey {
    #[must_use]
    pub const fn columns(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::UserItemDay => "user_id,item_id,day",
        }
    }
}

/// Something the cache and the remote store both hold.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Table / collection name, used in logs and the remote API paths.
    const KIND: &'static str;
    const CONFLICT_KEY: ConflictKey;

    fn id(&self) -> Uuid;
}

impl Entity for TrackedItem {
    const KIND: &'static str = "items";
    const CONFLICT_KEY: ConflictKey = ConflictKey::Id;

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Entity for ProgressRecord {
    const KIND: &'static str = "progress";
    const CONFLICT_KEY: ConflictKey = ConflictKey::UserItemDay;

    fn id(&self) -> Uuid {
        self.id
    }
}

// --- Read models ---

#[derive(Debug, Clone, Serialize)]
pub struct DayProgress {
    pub item_id: Uuid,
    pub name: String,
    pub day: NaiveDate,
    pub count: u32,
    pub goal: u32,
    pub scheduled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl DayProgress {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.count >= self.goal
    }
}
