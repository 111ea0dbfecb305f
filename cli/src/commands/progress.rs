use anyhow::{Result, bail};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use tally_core::coordinator::MutationOutcome;
use tally_core::models::TrackedItem;
use tally_core::service::HabitService;

use super::helpers::{instant_on, parse_date, progress_bar, truncate};

#[derive(Clone, Copy)]
pub(crate) enum Step {
    Up,
    Down,
}

pub(crate) fn cmd_step(
    svc: &HabitService,
    habit: &str,
    step: Step,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let item = svc.find_item(habit)?;
    let day = parse_date(date)?;
    if !item.is_active_on(day) {
        bail!("'{}' is not active on {day}", item.name);
    }

    let instant = instant_on(day);
    let outcome = match step {
        Step::Up => svc.increment(&item, &instant)?,
        Step::Down => svc.decrement(&item, &instant)?,
    };
    let goal = svc.coordinator().goal_on(&item, day);

    if json {
        let (status, count) = match outcome {
            MutationOutcome::Applied { ref record, .. } => ("applied", record.count),
            MutationOutcome::Unchanged { count } => ("unchanged", count),
            MutationOutcome::Busy => ("busy", svc.coordinator().progress_on(&item, day)),
            MutationOutcome::Discarded => ("discarded", 0),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "item_id": item.id,
                "name": item.name,
                "day": day,
                "count": count,
                "goal": goal,
                "status": status,
            }))?
        );
        return Ok(());
    }

    match outcome {
        MutationOutcome::Applied { record, .. } => {
            println!("{}  {}", item.name, progress_bar(record.count, goal, 10));
        }
        MutationOutcome::Unchanged { count } => {
            let bound = match step {
                Step::Up => "already at its goal",
                Step::Down => "already at zero",
            };
            println!("{} is {bound} ({count}/{goal}) for {day}", item.name);
        }
        MutationOutcome::Busy => {
            println!("{} is being updated; try again", item.name);
        }
        MutationOutcome::Discarded => {
            println!("{} was deleted", item.name);
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct TodayRow {
    #[tabled(rename = "Habit")]
    name: String,
    #[tabled(rename = "Progress")]
    progress: String,
    #[tabled(rename = "Unit")]
    unit: String,
    #[tabled(rename = "Done")]
    done: String,
}

pub(crate) fn cmd_today(svc: &HabitService, date: Option<String>, json: bool) -> Result<()> {
    let day = parse_date(date)?;
    let entries = svc.day_progress(day)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No active habits on {day}");
        return Ok(());
    }

    let rows: Vec<TodayRow> = entries
        .iter()
        .map(|e| TodayRow {
            name: if e.scheduled {
                truncate(&e.name, 30)
            } else {
                format!("{} (off day)", truncate(&e.name, 22))
            },
            progress: progress_bar(e.count, e.goal, 10),
            unit: e.unit.clone().unwrap_or_default(),
            done: if e.is_complete() { "yes" } else { "" }.to_string(),
        })
        .collect();

    let done = entries.iter().filter(|e| e.is_complete()).count();
    println!("=== {day} ({done}/{} done) ===", entries.len());
    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
    Ok(())
}

#[derive(Serialize)]
struct HistoryDay {
    day: NaiveDate,
    count: u32,
    goal: u32,
    scheduled: bool,
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "Day")]
    weekday: String,
    #[tabled(rename = "Progress")]
    progress: String,
}

fn history_days(svc: &HabitService, item: &TrackedItem, days: u32) -> Vec<HistoryDay> {
    let today = HabitService::today();
    let from = today - chrono::Duration::days(i64::from(days.max(1)) - 1);
    let records = svc.history(item, from, today);

    from.iter_days()
        .take_while(|d| *d <= today)
        .filter(|d| item.is_active_on(*d))
        .map(|day| {
            let record = records.iter().find(|r| r.day == day);
            HistoryDay {
                day,
                count: record.map_or(0, |r| r.count),
                goal: record.map_or(item.daily_goal, |r| r.goal),
                scheduled: item.is_scheduled_on(day),
            }
        })
        .collect()
}

pub(crate) fn cmd_history(svc: &HabitService, habit: &str, days: u32, json: bool) -> Result<()> {
    let item = svc.find_item(habit)?;
    let entries = history_days(svc, &item, days);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "item_id": item.id,
                "name": item.name,
                "days": entries,
            }))?
        );
        return Ok(());
    }

    if entries.is_empty() {
        println!("'{}' was not active in the last {days} days", item.name);
        return Ok(());
    }

    let rows: Vec<HistoryRow> = entries
        .iter()
        .rev()
        .map(|e| HistoryRow {
            date: e.day.to_string(),
            weekday: if e.scheduled {
                e.day.weekday().to_string()
            } else {
                format!("{} (off)", e.day.weekday())
            },
            progress: progress_bar(e.count, e.goal, 10),
        })
        .collect();

    let complete = entries.iter().filter(|e| e.count >= e.goal).count();
    println!("{}: {complete}/{} days complete", item.name, entries.len());
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}
