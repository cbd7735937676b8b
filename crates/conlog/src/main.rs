//! conlog - console log inspection
//!
//! Reads a durable console log and prints filtered, optionally collapsed rows
//! or a tag histogram. Also rotates a log directory on demand.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use conlog::{
    ConsoleConfig, DurableLog, DurableLogConfig, EntryStore, FilterEngine, FilterState, IngestSink,
    IngestionPipeline, NoopHost, RawEvent, Rotation, Severity, TagEngine, TagMode, format_row,
    read_tail,
};

#[derive(Parser, Debug)]
#[command(name = "conlog")]
#[command(about = "Inspect durable console logs")]
#[command(version)]
struct Cli {
    /// JSON configuration file (tag rules, collapse defaults).
    #[arg(short, long, env = "CONLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// One formatted line per row.
    Text,
    /// One JSON object per row.
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the filtered tail of a log file.
    Tail(TailArgs),

    /// Print the tag histogram of a log file.
    Tags {
        /// Log file to read.
        log: PathBuf,

        /// Records to load; 0 loads everything.
        #[arg(long, default_value_t = 1000)]
        cap: usize,
    },

    /// Rotate the log in a directory as if a new process had started.
    Rotate {
        /// Directory holding the log and its marker.
        dir: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct TailArgs {
    /// Log file to read.
    log: PathBuf,

    /// Records to load; 0 loads everything.
    #[arg(long, default_value_t = 1000)]
    cap: usize,

    /// Case-insensitive search text.
    #[arg(short, long)]
    search: Option<String>,

    /// Treat the search text as a regular expression.
    #[arg(long)]
    regex: bool,

    /// Group identical messages.
    #[arg(long)]
    collapse: bool,

    /// Severities to hide (repeatable).
    #[arg(long = "hide")]
    hide: Vec<Severity>,

    /// Only show entries carrying this tag (repeatable).
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Hide entries carrying this tag (repeatable).
    #[arg(long = "exclude-tag")]
    exclude_tags: Vec<String>,

    /// Lowest message number shown.
    #[arg(long)]
    min_number: Option<u32>,

    /// Highest message number shown.
    #[arg(long)]
    max_number: Option<u32>,

    /// Earliest timestamp shown (lexicographic).
    #[arg(long)]
    since: Option<String>,

    /// Latest timestamp shown (lexicographic).
    #[arg(long)]
    until: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("conlog=info".parse()?))
        .init();

    let config = cli
        .config
        .as_deref()
        .map_or_else(ConsoleConfig::default, ConsoleConfig::load);

    match cli.command {
        Commands::Tail(args) => tail(&config, &args, cli.format),
        Commands::Tags { log, cap } => tags(&config, &log, cap, cli.format),
        Commands::Rotate { dir } => rotate(dir),
    }
}

/// Loads a log file into a store, tagging and optionally collapsing it.
fn load_store(config: &ConsoleConfig, log: &Path, cap: usize, collapse: bool) -> anyhow::Result<EntryStore> {
    let history = read_tail(log, cap).with_context(|| format!("reading {}", log.display()))?;
    debug!(records = history.len(), path = %log.display(), "loaded log");

    let mut store = EntryStore::new(0);
    let mut pipeline = IngestionPipeline::new(
        IngestSink::new(),
        TagEngine::new(config.tags.clone()),
        Arc::new(NoopHost),
    );
    pipeline.seed(&mut store, history.into_iter().map(RawEvent::from), collapse);
    Ok(store)
}

fn tail(config: &ConsoleConfig, args: &TailArgs, format: Format) -> anyhow::Result<()> {
    let collapse = args.collapse || config.session.collapse;
    let store = load_store(config, &args.log, args.cap, collapse)?;

    let mut state = FilterState::new()
        .with_search(args.search.clone().unwrap_or_default())
        .with_regex(args.regex);
    for severity in &args.hide {
        state = state.hiding(*severity);
    }
    for tag in &args.tags {
        state = state.with_tag(tag, TagMode::Include);
    }
    for tag in &args.exclude_tags {
        state = state.with_tag(tag, TagMode::Exclude);
    }
    state.validate_search()?;

    let mut filter = FilterEngine::with_state(state, Duration::ZERO);
    filter.set_collapse(collapse);
    filter.set_number_range(args.min_number, args.max_number)?;
    filter.set_timestamp_range(args.since.as_deref(), args.until.as_deref())?;

    let count = filter.row_count(&store);
    for index in 0..count {
        let Some((entry, repeat)) = filter.row(&store, index) else {
            continue;
        };
        match format {
            Format::Text => println!("{}", format_row(entry, repeat)),
            Format::Json => println!(
                "{}",
                json!({
                    "number": entry.number,
                    "timestamp": entry.timestamp,
                    "severity": entry.severity,
                    "content": entry.content,
                    "detail": entry.detail,
                    "sequence": entry.sequence,
                    "count": repeat,
                    "tags": entry.tags.names().collect::<Vec<_>>(),
                })
            ),
        }
    }
    info!(rows = count, stored = store.len(), "tail complete");
    Ok(())
}

fn tags(config: &ConsoleConfig, log: &Path, cap: usize, format: Format) -> anyhow::Result<()> {
    let collapse = config.session.collapse;
    let store = load_store(config, log, cap, collapse)?;
    let mut filter = FilterEngine::new(Duration::ZERO);
    filter.set_collapse(collapse);

    for tag in filter.histogram(&store) {
        match format {
            Format::Text => println!("{:>8}  {}", tag.count, tag.name),
            Format::Json => println!("{}", json!({ "tag": tag.name, "count": tag.count })),
        }
    }
    Ok(())
}

fn rotate(dir: PathBuf) -> anyhow::Result<()> {
    let log = DurableLog::open(DurableLogConfig::new(dir)).context("opening log directory")?;
    match log.rotation() {
        Rotation::Rotated(backup) => println!("rotated to {}", backup.display()),
        Rotation::Fresh => println!("no previous log"),
        Rotation::SameProcess => println!("log already owned by this process"),
    }
    Ok(())
}
