use anyhow::Result;
use chrono::Utc;

use tally_core::service::HabitService;

pub(crate) async fn cmd_refresh(svc: &HabitService, json: bool) -> Result<()> {
    let report = svc.refresh(&Utc::now()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match (report.from, report.to) {
        (Some(from), Some(to)) => println!("Refreshed {from} .. {to}"),
        _ => println!("Refreshed"),
    }
    println!(
        "  habits: {} refreshed, {} failed",
        report.items_refreshed, report.items_failed
    );
    println!(
        "  records: {} accepted, {} kept local, {} confirmed",
        report.records_accepted, report.records_kept_local, report.keys_confirmed
    );
    Ok(())
}
