use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::daykey::{format_day, parse_day};
use crate::models::{ProgressRecord, Recurrence, TrackedItem};

const ITEM_COLUMNS: &str = "id, user_id, name, daily_goal, recurrence, start_date, end_date,
     icon, unit, tag, created_at, updated_at";

const PROGRESS_COLUMNS: &str = "id, user_id, item_id, day, count, goal, created_at, updated_at";

/// Filter for progress range reads. Every bound is optional and inclusive.
#[derive(Debug, Clone, Default)]
pub struct ProgressQuery<'a> {
    pub user_id: Option<&'a str>,
    pub item_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS items (
                    id TEXT PRIMARY KEY NOT NULL,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    daily_goal INTEGER NOT NULL CHECK (daily_goal > 0),
                    recurrence TEXT NOT NULL,
                    start_date TEXT NOT NULL,
                    end_date TEXT,
                    icon TEXT,
                    unit TEXT,
                    tag TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS progress (
                    id TEXT PRIMARY KEY NOT NULL,
                    user_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    day TEXT NOT NULL,
                    count INTEGER NOT NULL CHECK (count >= 0),
                    goal INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (user_id, item_id, day)
                );

                CREATE INDEX IF NOT EXISTS idx_items_user ON items(user_id);
                CREATE INDEX IF NOT EXISTS idx_progress_item_day ON progress(item_id, day);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                );

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn item_from_row(row: &rusqlite::Row) -> rusqlite::Result<TrackedItem> {
        let recurrence: String = row.get(4)?;
        let recurrence: Recurrence = serde_json::from_str(&recurrence)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
        let end_date: Option<String> = row.get(6)?;
        Ok(TrackedItem {
            id: uuid_col(row, 0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            daily_goal: row.get(3)?,
            recurrence,
            start_date: day_col(5, &row.get::<_, String>(5)?)?,
            end_date: end_date.map(|d| day_col(6, &d)).transpose()?,
            icon: row.get(7)?,
            unit: row.get(8)?,
            tag: row.get(9)?,
            created_at: timestamp_col(row, 10)?,
            updated_at: timestamp_col(row, 11)?,
        })
    }

    // Expects PROGRESS_COLUMNS order.
    fn progress_from_row(row: &rusqlite::Row) -> rusqlite::Result<ProgressRecord> {
        Ok(ProgressRecord {
            id: uuid_col(row, 0)?,
            user_id: row.get(1)?,
            item_id: uuid_col(row, 2)?,
            day: day_col(3, &row.get::<_, String>(3)?)?,
            count: row.get(4)?,
            goal: row.get(5)?,
            created_at: timestamp_col(row, 6)?,
            updated_at: timestamp_col(row, 7)?,
        })
    }

    // --- Items ---

    pub fn upsert_item(&self, item: &TrackedItem) -> Result<()> {
        let recurrence =
            serde_json::to_string(&item.recurrence).context("failed to encode recurrence")?;
        self.conn.execute(
            "INSERT INTO items (id, user_id, name, daily_goal, recurrence, start_date, end_date,
                                icon, unit, tag, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                name = excluded.name,
                daily_goal = excluded.daily_goal,
                recurrence = excluded.recurrence,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                icon = excluded.icon,
                unit = excluded.unit,
                tag = excluded.tag,
                updated_at = excluded.updated_at",
            params![
                item.id.to_string(),
                item.user_id,
                item.name,
                item.daily_goal,
                recurrence,
                format_day(item.start_date),
                item.end_date.map(format_day),
                item.icon,
                item.unit,
                item.tag,
                item.created_at.to_rfc3339(),
                item.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_item(&self, id: Uuid) -> Result<Option<TrackedItem>> {
        let item = self
            .conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
                params![id.to_string()],
                Self::item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    pub fn list_items(&self, user_id: Option<&str>) -> Result<Vec<TrackedItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE (?1 IS NULL OR user_id = ?1)
             ORDER BY name COLLATE NOCASE, created_at"
        ))?;
        let items = stmt
            .query_map(params![user_id], Self::item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn delete_item(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM items WHERE id = ?1", params![id.to_string()])?;
        Ok(rows > 0)
    }

    // --- Progress ---

    /// Upsert by primary id while keeping `(user_id, item_id, day)` unique.
    ///
    /// A row for the same day under a different id (minted by another device)
    /// is replaced by this one.
    pub fn upsert_progress(&self, record: &ProgressRecord) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let id = record.id.to_string();
        let item_id = record.item_id.to_string();
        let day = format_day(record.day);
        tx.execute(
            "DELETE FROM progress WHERE user_id = ?1 AND item_id = ?2 AND day = ?3 AND id != ?4",
            params![record.user_id, item_id, day, id],
        )?;
        tx.execute(
            "INSERT INTO progress (id, user_id, item_id, day, count, goal, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                item_id = excluded.item_id,
                day = excluded.day,
                count = excluded.count,
                goal = excluded.goal,
                updated_at = excluded.updated_at",
            params![
                id,
                record.user_id,
                item_id,
                day,
                record.count,
                record.goal,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_progress(&self, item_id: Uuid, day: NaiveDate) -> Result<Option<ProgressRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {PROGRESS_COLUMNS} FROM progress WHERE item_id = ?1 AND day = ?2"),
                params![item_id.to_string(), format_day(day)],
                Self::progress_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_progress(&self, query: &ProgressQuery) -> Result<Vec<ProgressRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM progress
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR item_id = ?2)
               AND (?3 IS NULL OR day >= ?3)
               AND (?4 IS NULL OR day <= ?4)
             ORDER BY item_id, day"
        ))?;
        let records = stmt
            .query_map(
                params![
                    query.user_id,
                    query.item_id.map(|id| id.to_string()),
                    query.from.map(format_day),
                    query.to.map(format_day),
                ],
                Self::progress_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn delete_progress(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM progress WHERE id = ?1", params![id.to_string()])?;
        Ok(rows > 0)
    }

    pub fn delete_progress_for_item(&self, item_id: Uuid) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM progress WHERE item_id = ?1",
            params![item_id.to_string()],
        )?;
        Ok(rows)
    }

    // --- Settings ---

    /// Stable id partitioning this installation's rows in the remote store.
    pub fn get_or_create_user_id(&self) -> Result<String> {
        if let Some(id) = self.get_setting("user_id")? {
            return Ok(id);
        }
        let user_id = Uuid::new_v4().to_string();
        self.set_setting("user_id", &user_id)?;
        Ok(user_id)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO settings (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

fn uuid_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn day_col(idx: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    parse_day(s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
