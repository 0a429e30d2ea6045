use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use contrib_rank::activity::{ActivityRecord, RecordOutcome};
use contrib_rank::config::{load_config, validate_config, write_default_config};
use contrib_rank::leaderboard::{Page, RankCategory, Scope, DEFAULT_PAGE_LIMIT};
use contrib_rank::{output, Engine, RankError};

const EXIT_SUCCESS: i32 = 0;
const EXIT_STORAGE: i32 = 2;
const EXIT_CONFIG: i32 = 4;

#[derive(Args, Debug, Clone)]
struct ScopeArgs {
    /// overall, papers, reviews, community or helpdesk
    #[arg(long, default_value = "overall")]
    category: RankCategory,

    #[arg(long)]
    campus: Option<String>,

    #[arg(long)]
    department: Option<String>,

    /// Only count activity from this long ago until now (e.g. 7d, 4w)
    #[arg(long, value_parser = humantime::parse_duration, conflicts_with = "from")]
    since: Option<Duration>,

    /// Window start, RFC 3339, inclusive
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Window end, RFC 3339, exclusive
    #[arg(long)]
    to: Option<DateTime<Utc>>,
}

impl ScopeArgs {
    fn to_scope(&self) -> anyhow::Result<Scope> {
        let mut scope = Scope::category(self.category);
        scope.campus_id = self.campus.clone();
        scope.department_id = self.department.clone();

        let start = match self.since {
            Some(since) => Some(Utc::now() - chrono::Duration::from_std(since)?),
            None => self.from,
        };
        Ok(scope.with_window(start, self.to))
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Table,
    Json,
    Tsv,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Validate the config and report every problem
    Check,
    /// Record a single activity
    Record {
        #[arg(long)]
        user: String,
        #[arg(long)]
        campus: String,
        #[arg(long)]
        department: String,
        /// Activity type, e.g. paper_upload or review_written
        #[arg(long = "type")]
        activity_type: String,
        #[arg(long)]
        resource: String,
        /// When it happened (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Record a batch of activities from a JSON array or JSON-lines file
    Ingest {
        file: PathBuf,
    },
    /// Show a ranked leaderboard page
    Leaderboard {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: usize,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Show one user's rank and badge progress
    Rank {
        user: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Recompute a user's totals from the event history
    Rebuild {
        user: String,
    },
    /// Rewrite the event journal without duplicate lines
    Compact,
}

#[derive(Parser, Debug)]
#[command(name = "contrib-rank")]
#[command(about = "Contribution scoring and leaderboard ranking", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (defaults to ~/.config/contrib-rank/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn exit_code(err: &RankError) -> i32 {
    match err {
        RankError::Configuration(_) => EXIT_CONFIG,
        _ => EXIT_STORAGE,
    }
}

/// JSON array if the file starts with `[`, otherwise one record per line.
fn read_records(file: &Path) -> anyhow::Result<Vec<ActivityRecord>> {
    use anyhow::Context;

    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    parse_records(&content).with_context(|| format!("Failed to parse {}", file.display()))
}

/// Elements or lines that are not valid records are reported and skipped;
/// only an array that is not JSON at all fails the whole file.
fn parse_records(content: &str) -> anyhow::Result<Vec<ActivityRecord>> {
    let mut records = Vec::new();

    if content.trim_start().starts_with('[') {
        let elements: Vec<serde_json::Value> = serde_json::from_str(content)?;
        for (i, element) in elements.into_iter().enumerate() {
            match serde_json::from_value(element) {
                Ok(record) => records.push(record),
                Err(e) => eprintln!("  element {}: skipped: {}", i + 1, e),
            }
        }
        return Ok(records);
    }

    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => eprintln!("  line {}: skipped: {}", lineno + 1, e),
        }
    }
    Ok(records)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let start_time = Instant::now();
    let config_path = cli.config.map(PathBuf::from);

    if let Commands::Init { force } = cli.command {
        match write_default_config(config_path, force) {
            Ok(path) => {
                println!("Config written to {}", path.display());
                std::process::exit(EXIT_SUCCESS);
            }
            Err(e) => {
                eprintln!("Config error: {:#}", e);
                std::process::exit(EXIT_CONFIG);
            }
        }
    }

    // Load config
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {:#}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Err(errors) = validate_config(&config) {
        eprintln!("Config errors:");
        for error in errors {
            eprintln!("  - {}", error);
        }
        std::process::exit(EXIT_CONFIG);
    }

    if matches!(cli.command, Commands::Check) {
        println!("Config OK");
        std::process::exit(EXIT_SUCCESS);
    }

    let engine = match Engine::open(&config) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Failed to open event journal at {}: {}", config.journal_path().display(), e);
            std::process::exit(exit_code(&e));
        }
    };

    if cli.verbose {
        eprintln!(
            "Loaded {} events for {} users in {:?}",
            engine.store().len(),
            engine.aggregator().len(),
            start_time.elapsed()
        );
    }

    let use_colors = output::should_use_colors();

    match cli.command {
        Commands::Init { .. } | Commands::Check => unreachable!("handled before opening the engine"),
        Commands::Record {
            user,
            campus,
            department,
            activity_type,
            resource,
            at,
        } => {
            let record = ActivityRecord {
                user_id: user,
                campus_id: campus,
                department_id: department,
                activity_type,
                resource_id: resource,
                occurred_at: at.unwrap_or_else(Utc::now),
            };
            match engine.record_activity(record) {
                Ok(RecordOutcome::Recorded(event)) => {
                    println!(
                        "Recorded #{} {} for {} (+{})",
                        event.id, event.activity_type, event.user_id, event.weight
                    );
                }
                Ok(RecordOutcome::Duplicate(event)) => {
                    println!(
                        "Already recorded as #{} at {}; no points awarded",
                        event.id, event.occurred_at
                    );
                }
                Err(e) => {
                    eprintln!("Failed to record activity: {}", e);
                    std::process::exit(exit_code(&e));
                }
            }
        }
        Commands::Ingest { file } => {
            let records = match read_records(&file) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("{:#}", e);
                    std::process::exit(EXIT_STORAGE);
                }
            };

            let (mut recorded, mut duplicates, mut rejected) = (0, 0, 0);
            let mut storage_failed = false;
            for (i, result) in engine.ingest(records).into_iter().enumerate() {
                match result {
                    Ok(RecordOutcome::Recorded(_)) => recorded += 1,
                    Ok(RecordOutcome::Duplicate(_)) => duplicates += 1,
                    Err(e) => {
                        rejected += 1;
                        storage_failed |= exit_code(&e) == EXIT_STORAGE;
                        eprintln!("  record {}: {}", i + 1, e);
                    }
                }
            }
            println!(
                "{} recorded, {} duplicate, {} rejected",
                recorded, duplicates, rejected
            );
            if storage_failed {
                std::process::exit(EXIT_STORAGE);
            }
        }
        Commands::Leaderboard {
            scope,
            offset,
            limit,
            format,
        } => {
            let scope = match scope.to_scope() {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Invalid scope: {}", e);
                    std::process::exit(EXIT_CONFIG);
                }
            };
            let page = match engine.leaderboard(&scope, Page::new(offset, limit)).await {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("Failed to rank {}: {}", scope, e);
                    std::process::exit(exit_code(&e));
                }
            };
            match format {
                OutputFormat::Table => {
                    println!("{}", output::format_leaderboard_table(&page, use_colors));
                    if cli.verbose {
                        for entry in &page.entries {
                            eprintln!("  {:>4}. {}", entry.rank, output::format_breakdown(entry));
                        }
                    }
                }
                OutputFormat::Tsv => println!("{}", output::format_leaderboard_tsv(&page)),
                OutputFormat::Json => match output::format_leaderboard_json(&page) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("Failed to serialize leaderboard: {}", e);
                        std::process::exit(EXIT_STORAGE);
                    }
                },
            }
        }
        Commands::Rank { user, scope } => {
            let scope = match scope.to_scope() {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Invalid scope: {}", e);
                    std::process::exit(EXIT_CONFIG);
                }
            };
            let mine = engine.my_rank(&user, &scope);
            let progress = engine.progress(&user);
            println!(
                "{}",
                output::format_my_rank(&user, &scope, mine.as_ref(), &progress, use_colors)
            );
        }
        Commands::Rebuild { user } => match engine.rebuild(&user) {
            Some(contribution) => println!("{}", output::format_contribution(&contribution)),
            None => println!("No activity recorded for {}", user),
        },
        Commands::Compact => match engine.compact() {
            Ok(kept) => println!("Journal compacted: {} events", kept),
            Err(e) => {
                eprintln!("Compaction failed: {}", e);
                std::process::exit(EXIT_STORAGE);
            }
        },
    }

    if cli.verbose {
        eprintln!("Done in {:?}", start_time.elapsed());
    }

    std::process::exit(EXIT_SUCCESS);
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{"user_id":"u1","campus_id":"A","department_id":"cs","activity_type":"paper_upload","resource_id":"p1","occurred_at":"2025-04-01T08:00:00Z"}"#;
    const MISSING_USER: &str = r#"{"campus_id":"A","department_id":"cs","activity_type":"paper_upload","resource_id":"p2","occurred_at":"2025-04-01T08:00:00Z"}"#;

    #[test]
    fn test_array_skips_malformed_elements() {
        let content = format!("[{}, {}, 42, {}]", MISSING_USER, VALID, VALID.replace("p1", "p3"));
        let records = parse_records(&content).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].resource_id, "p1");
        assert_eq!(records[1].resource_id, "p3");
    }

    #[test]
    fn test_lines_skip_malformed_records() {
        let content = format!("{}\n\n{{not json\n{}\n", VALID, MISSING_USER);
        let records = parse_records(&content).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id, "u1");
    }

    #[test]
    fn test_unterminated_array_fails() {
        assert!(parse_records(&format!("[{}", VALID)).is_err());
    }

    #[test]
    fn test_cli_parses_scope_flags() {
        let cli = Cli::try_parse_from([
            "contrib-rank",
            "leaderboard",
            "--category",
            "papers",
            "--campus",
            "A",
            "--limit",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Leaderboard { scope, limit, .. } => {
                assert_eq!(scope.category, RankCategory::Papers);
                assert_eq!(scope.campus.as_deref(), Some("A"));
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
