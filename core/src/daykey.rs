use std::fmt;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

/// Canonical day format used in keys, the database and the remote API.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// The UTC calendar day an instant falls in.
///
/// Always evaluated on the UTC calendar, never the device's local one, so two
/// devices in different timezones agree on which record a tap belongs to.
#[must_use]
pub fn normalize<Tz: TimeZone>(instant: &DateTime<Tz>) -> NaiveDate {
    instant.with_timezone(&Utc).date_naive()
}

#[must_use]
pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

pub fn parse_day(s: &str) -> chrono::ParseResult<NaiveDate> {
    NaiveDate::parse_from_str(s, DAY_FORMAT)
}

/// Composite (item, UTC day) identity of a progress record.
///
/// Displays as `"{item_id}-{YYYY-MM-DD}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey {
    pub item_id: Uuid,
    pub day: NaiveDate,
}

impl DayKey {
    #[must_use]
    pub fn new(item_id: Uuid, day: NaiveDate) -> Self {
        Self { item_id, day }
    }

    #[must_use]
    pub fn at<Tz: TimeZone>(item_id: Uuid, instant: &DateTime<Tz>) -> Self {
        Self::new(item_id, normalize(instant))
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.item_id, self.day.format(DAY_FORMAT))
    }
}

/// String form of [`DayKey::at`].
#[must_use]
pub fn key<Tz: TimeZone>(item_id: Uuid, instant: &DateTime<Tz>) -> String {
    DayKey::at(item_id, instant).to_string()
}
