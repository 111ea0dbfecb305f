use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use tally_core::service::HabitService;

/// Parse `today`/`yesterday`/`tomorrow` or `YYYY-MM-DD`, relative to the UTC day.
pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    let today = HabitService::today();
    match date_str {
        None => Ok(today),
        Some(s) => match s.as_str() {
            "today" => Ok(today),
            "yesterday" => Ok(today - chrono::Duration::days(1)),
            "tomorrow" => Ok(today + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

/// An instant inside `day`. Noon keeps it clear of the day boundary.
pub(crate) fn instant_on(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(12, 0, 0)
        .map_or_else(Utc::now, |naive| naive.and_utc())
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

/// One-line warning for a failure that happened in the background.
pub(crate) fn print_banner(message: &str, json: bool) {
    if json {
        eprintln!("{}", json_error(message));
    } else {
        eprintln!("Warning: sync problem ({message}). Local changes are kept.");
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

/// `3/8` style progress with a small bar.
pub(crate) fn progress_bar(count: u32, goal: u32, width: usize) -> String {
    let goal = goal.max(1);
    let filled = (count.min(goal) as usize * width) / goal as usize;
    format!(
        "{}{} {count}/{goal}",
        "#".repeat(filled),
        ".".repeat(width - filled)
    )
}
