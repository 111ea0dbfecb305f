use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use tally_core::models::{ItemUpdate, NewItem, Recurrence, TrackedItem};
use tally_core::service::HabitService;

use super::helpers::{parse_date, truncate};

pub(crate) struct HabitArgs {
    pub name: Option<String>,
    pub goal: Option<u32>,
    pub repeat: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub no_end: bool,
    pub icon: Option<String>,
    pub unit: Option<String>,
    pub tag: Option<String>,
}

#[derive(Tabled)]
struct HabitRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Habit")]
    name: String,
    #[tabled(rename = "Goal")]
    goal: String,
    #[tabled(rename = "Repeats")]
    repeat: String,
    #[tabled(rename = "Active")]
    window: String,
    #[tabled(rename = "Tag")]
    tag: String,
}

impl From<&TrackedItem> for HabitRow {
    fn from(item: &TrackedItem) -> Self {
        let name = match item.icon {
            Some(ref icon) => format!("{icon} {}", item.name),
            None => item.name.clone(),
        };
        let goal = match item.unit {
            Some(ref unit) => format!("{} {unit}", item.daily_goal),
            None => item.daily_goal.to_string(),
        };
        let window = match item.end_date {
            Some(end) => format!("{} .. {end}", item.start_date),
            None => format!("from {}", item.start_date),
        };
        Self {
            id: item.id.to_string()[..8].to_string(),
            name: truncate(&name, 30),
            goal,
            repeat: item.recurrence.label(),
            window,
            tag: item.tag.clone().unwrap_or_default(),
        }
    }
}

fn print_habit(item: &TrackedItem) {
    let table = Table::new([HabitRow::from(item)])
        .with(Style::rounded())
        .to_string();
    println!("{table}");
}

pub(crate) async fn cmd_habit_add(
    svc: &HabitService,
    name: String,
    args: HabitArgs,
    json: bool,
) -> Result<()> {
    let start_date = parse_date(args.start)?;
    let end_date = args.end.map(|s| parse_date(Some(s))).transpose()?;
    let recurrence = Recurrence::parse(args.repeat.as_deref().unwrap_or("daily"))?;

    let item = svc
        .create_item(NewItem {
            name,
            daily_goal: args.goal.unwrap_or(1),
            recurrence,
            start_date,
            end_date,
            icon: args.icon,
            unit: args.unit,
            tag: args.tag,
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
    } else {
        println!("Added habit '{}' ({})", item.name, item.id);
        print_habit(&item);
    }
    Ok(())
}

pub(crate) fn cmd_habit_list(svc: &HabitService, all: bool, json: bool) -> Result<()> {
    let today = HabitService::today();
    let items: Vec<TrackedItem> = svc
        .list_items()?
        .into_iter()
        .filter(|i| all || i.is_active_on(today))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No habits yet. Add one with: tally habit add <name> --goal <n>");
        return Ok(());
    }

    let rows: Vec<HabitRow> = items.iter().map(HabitRow::from).collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_habit_edit(
    svc: &HabitService,
    habit: &str,
    args: HabitArgs,
    json: bool,
) -> Result<()> {
    if args.no_end && args.end.is_some() {
        bail!("--end and --no-end cannot be combined");
    }
    let item = svc.find_item(habit)?;

    let update = ItemUpdate {
        name: args.name,
        daily_goal: args.goal,
        recurrence: args.repeat.as_deref().map(Recurrence::parse).transpose()?,
        start_date: args.start.map(|s| parse_date(Some(s))).transpose()?,
        end_date: if args.no_end {
            Some(None)
        } else {
            args.end.map(|s| parse_date(Some(s)).map(Some)).transpose()?
        },
        icon: args.icon.map(Some),
        unit: args.unit.map(Some),
        tag: args.tag.map(Some),
    };

    let updated = svc.update_item(&item, &update)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!("Updated habit '{}'", updated.name);
        print_habit(&updated);
    }
    Ok(())
}

pub(crate) async fn cmd_habit_delete(svc: &HabitService, habit: &str, json: bool) -> Result<()> {
    let item = svc.find_item(habit)?;
    svc.delete_item(&item).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "deleted": true, "id": item.id, "name": item.name })
        );
    } else {
        println!("Deleted habit '{}' and its progress", item.name);
    }
    Ok(())
}
