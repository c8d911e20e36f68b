#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::Confirm;
use imgforge::{Config, CostSummary, Session, SessionManager, Store};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_REPORT_DAYS: u32 = 30;
const MAX_REPORT_DAYS: i64 = 36_500;

/// `imgforge` - inspect image sessions and audit generation spend.
#[derive(Parser, Debug)]
#[command(name = "imgforge")]
#[command(version)]
#[command(about = "Session history and cost ledger for iterative image generation.", long_about = None)]
struct Cli {
    /// Database file (defaults to the configured path)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List, inspect and delete sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Report spend from the cost ledger
    Cost {
        /// Only today's spend (UTC)
        #[arg(long, conflicts_with = "days")]
        today: bool,

        /// Only the last N days (1 to 36500)
        #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..=MAX_REPORT_DAYS))]
        days: Option<u32>,

        /// Break spend down by provider
        #[arg(long, conflicts_with_all = ["by_day", "session"])]
        by_provider: bool,

        /// Break spend down by UTC day
        #[arg(long, conflicts_with = "session")]
        by_day: bool,

        /// Spend of a single session
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },

    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommands {
    /// List sessions, most recently active first
    List,
    /// Show a session and its full iteration history
    Show { id: String },
    /// Delete a session with its iterations and cost entries
    Delete {
        id: String,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    /// Show database location and row counts
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to imgforge=info
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("imgforge=info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    // An explicit --db must not write a config file as a side effect.
    let config = match &cli.db {
        Some(_) => Config::load_if_present()?,
        None => Config::load_or_init()?,
    };
    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path());
    let store = Store::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    match cli.command {
        Commands::Sessions { command } => handle_sessions(command, store, &config),
        Commands::Cost {
            today,
            days,
            by_provider,
            by_day,
            session,
        } => handle_cost(&store, today, days, by_provider, by_day, session.as_deref()),
        Commands::Db {
            command: DbCommands::Info,
        } => handle_db_info(&store),
    }
}

fn handle_sessions(command: SessionCommands, store: Store, config: &Config) -> Result<()> {
    match command {
        SessionCommands::List => {
            let sessions = store.list_sessions()?;
            if sessions.is_empty() {
                println!("No sessions yet.");
                return Ok(());
            }
            println!("Sessions ({}):", sessions.len());
            println!();
            for session in &sessions {
                let count = store.count_iterations(&session.id)?;
                println!(
                    "  {} {}  {} iteration(s), model {}, updated {}",
                    style(short_id(&session.id)).dim(),
                    style(session.display_name()).white().bold(),
                    count,
                    display_model(session),
                    session.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
            Ok(())
        }
        SessionCommands::Show { id } => {
            let mut manager =
                SessionManager::new(store, config.images_dir(), config.default_model.clone());
            let session = manager.load(&id)?;
            let history = manager.history()?;
            let spent = manager.get_session_cost()?;

            println!("{}", style(session.display_name()).white().bold());
            println!("  id:       {}", session.id);
            println!("  model:    {}", display_model(&session));
            println!("  created:  {}", session.created_at.format("%Y-%m-%d %H:%M:%S"));
            println!("  updated:  {}", session.updated_at.format("%Y-%m-%d %H:%M:%S"));
            println!("  spent:    {}", format_summary(&spent));
            if let Some(dir) = manager.session_dir() {
                println!("  images:   {}", dir.display());
            }
            println!();

            if history.is_empty() {
                println!("No iterations.");
                return Ok(());
            }
            let current_id = session.current_iteration_id.as_deref();
            for (n, iteration) in history.iter().enumerate() {
                let marker = if Some(iteration.id.as_str()) == current_id {
                    style("*").green().bold()
                } else {
                    style(" ")
                };
                let parent = iteration
                    .parent_id
                    .as_deref()
                    .map_or_else(|| "root".to_string(), |p| format!("<- {}", short_id(p)));
                println!(
                    "{marker} {:>3}. {} {:<8} {}  {}",
                    n + 1,
                    style(short_id(&iteration.id)).dim(),
                    iteration.operation.as_str(),
                    style(parent).dim(),
                    imgforge::util::truncate_with_ellipsis(
                        &imgforge::util::single_line(&iteration.prompt),
                        60
                    )
                );
            }
            Ok(())
        }
        SessionCommands::Delete { id, yes } => {
            let mut manager =
                SessionManager::new(store, config.images_dir(), config.default_model.clone());
            let session = manager.store().get_session(&id)?;
            let count = manager.store().count_iterations(&id)?;

            if !yes {
                let confirmed = Confirm::new()
                    .with_prompt(format!(
                        "Delete session '{}' and its {} iteration(s)?",
                        session.display_name(),
                        count
                    ))
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if !confirmed {
                    println!("Aborted.");
                    return Ok(());
                }
            }

            manager.delete_session(&id)?;
            info!(session_id = %id, iterations = count, "session removed");
            println!(
                "  {} Deleted session {}",
                style("✓").green().bold(),
                session.display_name()
            );
            Ok(())
        }
    }
}

fn handle_cost(
    store: &Store,
    today: bool,
    days: Option<u32>,
    by_provider: bool,
    by_day: bool,
    session: Option<&str>,
) -> Result<()> {
    if let Some(id) = session {
        let target = store.get_session(id)?;
        let summary = store.get_session_cost(id)?;
        println!("Session {}: {}", target.display_name(), format_summary(&summary));
        for entry in store.list_session_costs(id)? {
            println!(
                "  {}  {:<10} {:<14} {} image(s)  ${:.4}",
                entry.timestamp.format("%Y-%m-%d %H:%M"),
                entry.provider,
                entry.model,
                entry.image_count,
                entry.cost
            );
        }
        return Ok(());
    }

    if by_provider {
        let rows = store.get_cost_by_provider()?;
        if rows.is_empty() {
            println!("No spend recorded.");
        }
        for row in rows {
            println!(
                "  {:<12} ${:.4}  {} image(s)",
                style(&row.provider).white().bold(),
                row.total_cost,
                row.image_count
            );
        }
        return Ok(());
    }

    let now = Utc::now();
    if by_day {
        let (start, end) = cost_window(now, today, Some(days.unwrap_or(DEFAULT_REPORT_DAYS)));
        let rows = store.get_daily_costs(start, end)?;
        if rows.is_empty() {
            println!("No spend recorded in this period.");
        }
        for row in rows {
            println!(
                "  {}  ${:.4}  {} image(s), {} call(s)",
                row.day, row.total_cost, row.image_count, row.entry_count
            );
        }
        return Ok(());
    }

    if today || days.is_some() {
        let (start, end) = cost_window(now, today, days);
        let summary = store.get_cost_by_date_range(start, end)?;
        let label = if today {
            "Today".to_string()
        } else {
            format!("Last {} day(s)", days.unwrap_or_default())
        };
        println!("{label}: {}", format_summary(&summary));
        return Ok(());
    }

    println!("Total: {}", format_summary(&store.get_total_cost()?));
    Ok(())
}

fn handle_db_info(store: &Store) -> Result<()> {
    let stats = store.stats()?;
    let location = store
        .path()
        .map_or_else(|| "(in memory)".to_string(), |p| p.display().to_string());
    println!("Database:     {location}");
    println!("Sessions:     {}", stats.sessions);
    println!("Iterations:   {}", stats.iterations);
    println!("Cost entries: {}", stats.cost_entries);
    Ok(())
}

/// `[start, end)` for a report. `today` wins over `days`; with neither the
/// window covers everything up to `now`.
fn cost_window(now: DateTime<Utc>, today: bool, days: Option<u32>) -> (DateTime<Utc>, DateTime<Utc>) {
    if today {
        let start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        return (start, start + Duration::days(1));
    }
    let end = now
        .checked_add_signed(Duration::seconds(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let start = days
        .and_then(|days| now.checked_sub_signed(Duration::days(i64::from(days))))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    (start, end)
}

fn format_summary(summary: &CostSummary) -> String {
    format!(
        "${:.4} across {} image(s) in {} call(s)",
        summary.total_cost, summary.image_count, summary.entry_count
    )
}

fn display_model(session: &Session) -> &str {
    if session.model.is_empty() {
        "-"
    } else {
        &session.model
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn cost_flags_parse_with_global_db() {
        let cli = Cli::try_parse_from(["imgforge", "cost", "--days", "7", "--db", "/tmp/x.db"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        match cli.command {
            Commands::Cost { days, today, .. } => {
                assert_eq!(days, Some(7));
                assert!(!today);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn today_conflicts_with_days() {
        assert!(Cli::try_parse_from(["imgforge", "cost", "--today", "--days", "3"]).is_err());
    }

    #[test]
    fn today_window_covers_the_utc_day() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        let (start, end) = cost_window(now, true, Some(5));
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 14, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn days_window_ends_after_now() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap();
        let (start, end) = cost_window(now, false, Some(2));
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 12, 12, 0, 0).unwrap());
        assert!(end > now);
    }

    #[test]
    fn days_outside_supported_range_are_rejected() {
        assert!(Cli::try_parse_from(["imgforge", "cost", "--days", "4000000000"]).is_err());
        assert!(Cli::try_parse_from(["imgforge", "cost", "--by-day", "--days", "36501"]).is_err());
        assert!(Cli::try_parse_from(["imgforge", "cost", "--days", "0"]).is_err());
        assert!(Cli::try_parse_from(["imgforge", "cost", "--days", "36500"]).is_ok());
    }

    #[test]
    fn huge_day_window_clamps_to_epoch() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap();
        let (start, end) = cost_window(now, false, Some(u32::MAX));
        assert_eq!(start, DateTime::<Utc>::UNIX_EPOCH);
        assert!(end > now);
    }

    #[test]
    fn no_window_starts_at_epoch() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap();
        assert_eq!(cost_window(now, false, None).0, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn short_id_handles_short_input() {
        assert_eq!(short_id("abcdef0123456789"), "abcdef01");
        assert_eq!(short_id("abc"), "abc");
    }
}
