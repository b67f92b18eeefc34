//! convostat - admin CLI for per-user conversation analytics
//!
//! Commands:
//! - Ingest events from a JSON Lines file
//! - Show, recompute, or reconcile a user's aggregate
//! - Run a retention sweep
//! - Show usage trends
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/convostat/analytics.db (~/.local/share/convostat/analytics.db)
//! - Config: $XDG_CONFIG_HOME/convostat/config.toml (~/.config/convostat/config.toml)

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use convostat_core::analytics::TimeStats;
use convostat_core::{
    AnalyticsService, Backoff, Config, Database, Error, Event, RetentionSweeper, StatAggregate,
    SweepReport, TimeWindow, UsageTrends,
};

#[derive(Parser)]
#[command(name = "convostat")]
#[command(about = "Per-user conversation analytics")]
#[command(version)]
struct Args {
    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text", global = true, value_parser = ["text", "json"])]
    format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply events from a JSON Lines file ("-" reads stdin)
    Ingest {
        /// One event per line
        file: PathBuf,
    },

    /// Show a user's current aggregate
    Show {
        user_id: String,
    },

    /// Recompute a user's aggregate from history without storing it
    Recompute {
        user_id: String,

        /// Start of the window (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        since: Option<DateTime<Utc>>,

        /// End of the window (RFC 3339, default: now)
        #[arg(long, value_parser = parse_time)]
        until: Option<DateTime<Utc>>,
    },

    /// Replace a user's aggregate with one recomputed from full history
    Reconcile {
        user_id: String,
    },

    /// Delete users idle longer than the retention horizon
    Sweep {
        /// Horizon in days (default: retention.horizon_days from config)
        #[arg(long)]
        horizon_days: Option<u32>,
    },

    /// Show day-level usage trends
    Trends {
        user_id: String,

        /// Number of days to look back
        #[arg(short, long, default_value_t = 30)]
        days: u32,
    },
}

fn parse_time(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp '{}': {}", s, e))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let _log_guard =
        convostat_core::logging::init(&config.logging).context("failed to initialize logging")?;

    // Open database
    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path, &config.store).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let service = AnalyticsService::new(db).with_retry(Backoff::from_config(&config.store));
    let json = args.format == "json";

    match args.command {
        Command::Ingest { file } => cmd_ingest(&service, &file, json),
        Command::Show { user_id } => {
            let aggregate = service
                .get_current(&user_id)
                .with_context(|| format!("failed to load aggregate for {}", user_id))?;
            print_aggregate(&aggregate, json)
        }
        Command::Recompute {
            user_id,
            since,
            until,
        } => {
            let until = until.unwrap_or_else(Utc::now);
            let window = match since {
                Some(since) => TimeWindow::new(since, until)?,
                None => TimeWindow::until(until),
            };
            let aggregate = service
                .recompute(&user_id, window)
                .with_context(|| format!("failed to recompute aggregate for {}", user_id))?;
            print_aggregate(&aggregate, json)
        }
        Command::Reconcile { user_id } => {
            let aggregate = service
                .reconcile(&user_id)
                .with_context(|| format!("failed to reconcile {}", user_id))?;
            print_aggregate(&aggregate, json)
        }
        Command::Sweep { horizon_days } => {
            if horizon_days.is_some() {
                config.retention.horizon_days = horizon_days;
            }
            let sweeper = RetentionSweeper::from_config(&config.retention)
                .context("cannot sweep without a retention horizon")?;
            let report = sweeper
                .sweep(&service, Utc::now())
                .context("retention sweep failed")?;
            print_sweep(&report, json)
        }
        Command::Trends { user_id, days } => {
            let trends = service
                .usage_trends(&user_id, days)
                .with_context(|| format!("failed to compute trends for {}", user_id))?;
            print_trends(&trends, json)
        }
    }
}

// ============================================
// Ingest
// ============================================

fn cmd_ingest(service: &AnalyticsService<Database>, file: &PathBuf, json: bool) -> Result<()> {
    let reader: Box<dyn BufRead> = if file.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let f = File::open(file).with_context(|| format!("failed to open {}", file.display()))?;
        Box::new(BufReader::new(f))
    };

    let mut applied = 0usize;
    let mut rejected = 0usize;

    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        let line = line.with_context(|| format!("failed to read line {}", line_no))?;
        if line.trim().is_empty() {
            continue;
        }

        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                eprintln!("line {}: malformed event: {}", line_no, e);
                rejected += 1;
                continue;
            }
        };

        let user_id = event.user_id.clone();
        match service.ingest(&user_id, event) {
            Ok(_) => applied += 1,
            Err(e @ Error::InvalidEvent(_)) | Err(e @ Error::StaleEvent { .. }) => {
                eprintln!("line {}: {}", line_no, e);
                rejected += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to ingest line {}", line_no));
            }
        }
    }

    tracing::info!(applied, rejected, "Ingest complete");

    if json {
        println!(
            "{}",
            serde_json::json!({ "applied": applied, "rejected": rejected })
        );
    } else {
        println!("Ingest complete:");
        println!("  Events applied:  {}", applied);
        println!("  Events rejected: {}", rejected);
    }
    Ok(())
}

// ============================================
// Output
// ============================================

fn print_aggregate(agg: &StatAggregate, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(agg)?);
        return Ok(());
    }

    let period = match (agg.period_start, agg.period_end) {
        (Some(start), Some(end)) => format!("{} .. {}", start.to_rfc3339(), end.to_rfc3339()),
        _ => "(no events)".to_string(),
    };

    println!("User: {}", agg.user_id);
    println!("  Period:          {}", period);
    println!("  Sequence:        {}", agg.event_sequence_number);
    println!("  Last updated:    {}", agg.last_updated_at.to_rfc3339());

    let m = &agg.messages;
    println!("Messages:");
    println!(
        "  Total:           {} ({} user, {} assistant)",
        m.total, m.user_count, m.assistant_count
    );
    println!("  Avg user len:    {:.1}", m.avg_user_length);
    println!("  Avg reply len:   {:.1}", m.avg_assistant_length);

    let t = &agg.time;
    println!("Timing:");
    println!(
        "  Avg latency:     {:.2}s ({} samples)",
        t.avg_response_latency, t.latency_samples
    );
    if let Some(hour) = t.peak_hour() {
        println!("  Peak hour:       {:02}:00", hour);
    }
    if let Some(day) = t.busiest_weekday() {
        println!("  Busiest day:     {}", TimeStats::day_name(day));
    }

    println!("Topics:");
    println!(
        "  Top category:    {}",
        agg.categories.dominant_category().unwrap_or("-")
    );
    let tags = agg.tags.top_tags();
    if tags.is_empty() {
        println!("  Top tags:        -");
    } else {
        println!("  Top tags:        {}", tags.join(", "));
    }

    let c = &agg.conversations;
    println!("Conversations:");
    println!("  Closed:          {}", c.total_conversations);
    println!("  Active (24h):    {}", c.active_in_window);
    println!("  Avg messages:    {:.1}", c.avg_messages_per_conversation);
    println!(
        "  Avg duration:    {:.1} min",
        c.avg_conversation_duration_minutes
    );
    Ok(())
}

fn print_sweep(report: &SweepReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Sweep complete:");
    println!("  Users swept:     {}", report.swept.len());
    println!("  Users skipped:   {}", report.skipped.len());
    println!("  Failures:        {}", report.failed.len());
    for failure in &report.failed {
        println!("    {}: {}", failure.user_id, failure.error);
    }
    Ok(())
}

fn print_trends(trends: &UsageTrends, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(trends)?);
        return Ok(());
    }

    println!(
        "Trends {} .. {}:",
        trends.window.start.date_naive(),
        trends.window.end.date_naive()
    );
    println!("  Conversations:   {}", trends.total_conversations);
    println!("  Active days:     {}", trends.active_days);
    match trends.peak_day {
        Some(day) => println!("  Peak day:        {}", day),
        None => println!("  Peak day:        -"),
    }
    println!("  Avg latency:     {:.2}s", trends.avg_response_latency);
    println!("  Avg message len: {:.1}", trends.avg_message_length);

    if !trends.category_trends.is_empty() {
        let mut categories: Vec<(&String, &u64)> = trends.category_trends.iter().collect();
        categories.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        println!("Categories:");
        for (category, count) in categories {
            println!("  {}: {}", category, count);
        }
    }

    if !trends.daily_conversation_counts.is_empty() {
        println!("Daily conversations:");
        for (day, count) in &trends.daily_conversation_counts {
            println!("  {}  {}", day, count);
        }
    }
    Ok(())
}
