mod commands;
mod config;
mod remote;
mod server;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use crate::commands::{
    HabitArgs, Step, cmd_habit_add, cmd_habit_delete, cmd_habit_edit, cmd_habit_list,
    cmd_history, cmd_refresh, cmd_step, cmd_today, print_banner,
};
use crate::config::Config;
use crate::remote::HttpRemoteStore;
use tally_core::db::Database;
use tally_core::models::{ProgressRecord, TrackedItem};
use tally_core::service::{HabitService, Remotes, SyncOptions};

#[derive(Parser)]
#[command(
    name = "tally",
    version,
    about = "A simple, local-first habit tracker CLI",
    long_about = "Count daily progress toward habit goals. Works offline; \
                  mirrors to a `tally serve` instance when [remote] url is configured."
)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Suppress log output
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Database path (default: tally.db in the data directory)
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage habits
    Habit {
        #[command(subcommand)]
        command: HabitCommands,
    },
    /// Add one to a habit's count for a day
    Inc {
        /// Habit name, id, or id prefix
        habit: String,
        /// Date (YYYY-MM-DD or today/yesterday, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Take one off a habit's count for a day
    Dec {
        /// Habit name, id, or id prefix
        habit: String,
        /// Date (YYYY-MM-DD or today/yesterday, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show progress of every active habit for a day
    Today {
        /// Date (YYYY-MM-DD or today/yesterday, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a habit's counts for the last N days
    History {
        /// Habit name, id, or id prefix
        habit: String,
        /// Number of days to show
        #[arg(short, long, default_value = "7")]
        days: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pull recent progress from the remote store
    Refresh {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start the REST API server other devices sync through
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum HabitCommands {
    /// Add a habit
    Add {
        /// Habit name
        name: String,
        #[command(flatten)]
        fields: HabitFields,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List habits active today
    List {
        /// Include habits outside their date window
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change a habit's fields
    Edit {
        /// Habit name, id, or id prefix
        habit: String,
        /// New name
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        fields: HabitFields,
        /// Remove the end date
        #[arg(long)]
        no_end: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a habit and all of its progress
    Delete {
        /// Habit name, id, or id prefix
        habit: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct HabitFields {
    /// Daily goal (count per day)
    #[arg(short, long)]
    goal: Option<u32>,
    /// daily, weekly, weekdays, weekends, or a list like mon,wed,fri
    #[arg(short, long)]
    repeat: Option<String>,
    /// First active day (YYYY-MM-DD, default: today)
    #[arg(long)]
    start: Option<String>,
    /// Last active day (YYYY-MM-DD)
    #[arg(long)]
    end: Option<String>,
    /// Icon shown next to the name
    #[arg(long)]
    icon: Option<String>,
    /// Unit label, e.g. glasses
    #[arg(long)]
    unit: Option<String>,
    /// Free-form tag
    #[arg(long)]
    tag: Option<String>,
}

impl HabitFields {
    fn into_args(self, name: Option<String>, no_end: bool) -> HabitArgs {
        HabitArgs {
            name,
            goal: self.goal,
            repeat: self.repeat,
            start: self.start,
            end: self.end,
            no_end,
            icon: self.icon,
            unit: self.unit,
            tag: self.tag,
        }
    }
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Self::Habit { command } => match command {
                HabitCommands::Add { json, .. }
                | HabitCommands::List { json, .. }
                | HabitCommands::Edit { json, .. }
                | HabitCommands::Delete { json, .. } => *json,
            },
            Self::Inc { json, .. }
            | Self::Dec { json, .. }
            | Self::Today { json, .. }
            | Self::History { json, .. }
            | Self::Refresh { json } => *json,
            Self::Serve { .. } => false,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info,hyper=info,reqwest=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn sync_options(config: &Config, json: bool) -> SyncOptions {
    let mut options = SyncOptions {
        refresh_window_days: config.sync.refresh_window_days,
        mirror_queue_capacity: config.sync.mirror_queue_capacity,
        on_complete: None,
    };
    if !json {
        options.on_complete = Some(Arc::new(|item: &TrackedItem, record: &ProgressRecord| {
            println!("Goal reached: {} ({}/{})", item.name, record.count, record.goal);
        }));
    }
    options
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.db)?;

    if let Commands::Serve {
        port,
        ref bind,
        no_auth,
    } = cli.command
    {
        let db = Database::open(&config.db_path)?;
        let (api_key, new_api_key) = if no_auth {
            (None, false)
        } else {
            let (key, new) = config.load_or_create_api_key()?;
            (Some(key), new)
        };
        return server::start_server(db, port, bind, api_key, new_api_key).await;
    }

    let json = cli.command.json();
    let remotes = match config.remote.url {
        Some(ref url) => {
            let client = HttpRemoteStore::new(url, config.remote_api_key()?)?;
            Remotes::shared(Arc::new(client))
        }
        None => Remotes::disconnected(),
    };
    let svc = HabitService::open(&config.db_path, remotes, sync_options(&config, json))?;

    let loaded = svc.load_cached()?;
    debug!(loaded, "progress loaded from cache");
    if config.remote.url.is_some() && !matches!(cli.command, Commands::Refresh { .. }) {
        svc.refresh(&Utc::now()).await?;
    }

    let result = dispatch(&svc, cli.command).await;
    svc.flush().await;

    if let Some(message) = svc.error_message() {
        print_banner(&message, json);
    }
    result
}

async fn dispatch(svc: &HabitService, command: Commands) -> Result<()> {
    match command {
        Commands::Habit { command } => match command {
            HabitCommands::Add { name, fields, json } => {
                cmd_habit_add(svc, name, fields.into_args(None, false), json).await
            }
            HabitCommands::List { all, json } => cmd_habit_list(svc, all, json),
            HabitCommands::Edit {
                habit,
                name,
                fields,
                no_end,
                json,
            } => cmd_habit_edit(svc, &habit, fields.into_args(name, no_end), json),
            HabitCommands::Delete { habit, json } => cmd_habit_delete(svc, &habit, json).await,
        },
        Commands::Inc { habit, date, json } => cmd_step(svc, &habit, Step::Up, date, json),
        Commands::Dec { habit, date, json } => cmd_step(svc, &habit, Step::Down, date, json),
        Commands::Today { date, json } => cmd_today(svc, date, json),
        Commands::History { habit, days, json } => cmd_history(svc, &habit, days, json),
        Commands::Refresh { json } => cmd_refresh(svc, json).await,
        Commands::Serve { .. } => bail!("serve runs without a habit session"),
    }
}
