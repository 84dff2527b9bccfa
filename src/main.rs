//! # drive-index CLI (`dix`)
//!
//! The `dix` binary indexes directory-backed drives into a SQLite database
//! and answers queries over the resulting tables.
//!
//! ## Usage
//!
//! ```bash
//! dix --config ./config/dix.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dix init` | Create the SQLite database |
//! | `dix drive init <dir>` | Turn a directory into a drive and print its origin |
//! | `dix index <dir>...` | Snapshot drives and bring their records up to date |
//! | `dix unindex <dir>...` | Drop every record derived from the drives |
//! | `dix sources` | List indexed drives and their versions |
//! | `dix tables` | List tables with record counts and checksums |
//! | `dix get <table> <url>` | Print one record |
//! | `dix query <table>` | Query a table through one of its indexes |
//!
//! ## Examples
//!
//! ```bash
//! dix drive init ./alice
//! dix index ./alice ./bob --config ./config/dix.toml
//! dix query posts --where createdAt --above 1700000000 --reverse --limit 10
//! dix get profiles drive://1f0c.../profile.json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use drive_index::config;
use drive_index::db;
use drive_index::get;
use drive_index::index_cmd;
use drive_index::migrate;
use drive_index::progress::ProgressMode;
use drive_index::query_cmd::{self, Condition, Output, QueryRequest};
use drive_index::sources;
use drive_index::stats;

/// drive-index CLI: a local-first index over versioned, append-only file
/// stores.
///
/// All commands except `drive init` accept a `--config` flag pointing to a
/// TOML configuration file. See `config/dix.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dix",
    about = "drive-index: a local-first index over versioned, append-only file stores",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dix.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Manage drive directories.
    Drive {
        #[command(subcommand)]
        action: DriveAction,
    },

    /// Snapshot drives and index their changes since the last run.
    ///
    /// Table definitions that changed since the last run reset every index
    /// first; the drives are then re-read from version 0.
    Index {
        /// Drive directories.
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        /// Index the existing change log without recording on-disk edits.
        #[arg(long)]
        no_snapshot: bool,

        /// Progress output on stderr: off, human, or json. Defaults to human
        /// when stderr is a terminal.
        #[arg(long, value_parser = parse_progress)]
        progress: Option<ProgressMode>,
    },

    /// Remove every record derived from the given drives.
    Unindex {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },

    /// List indexed drives and the version each was indexed to.
    Sources,

    /// List tables with their record counts and checksums.
    Tables,

    /// Print one record by URL.
    Get {
        table: String,
        url: String,
    },

    /// Query a table.
    Query(QueryArgs),
}

#[derive(Subcommand)]
enum DriveAction {
    /// Turn a directory into a drive and print its origin.
    Init { dir: PathBuf },
}

#[derive(clap::Args)]
struct QueryArgs {
    table: String,

    /// Index the condition applies to (`:url` for the record URL).
    #[arg(long = "where")]
    where_index: Option<String>,

    #[arg(long, conflicts_with_all = ["not_equal", "above", "above_or_equal", "below", "below_or_equal", "between", "starts_with", "any_of", "none_of"])]
    equals: Option<String>,
    #[arg(long)]
    not_equal: Option<String>,
    #[arg(long)]
    above: Option<String>,
    #[arg(long)]
    above_or_equal: Option<String>,
    #[arg(long)]
    below: Option<String>,
    #[arg(long)]
    below_or_equal: Option<String>,
    /// Inclusive range: `--between LOW HIGH`.
    #[arg(long, num_args = 2, value_names = ["LOW", "HIGH"])]
    between: Option<Vec<String>>,
    #[arg(long)]
    starts_with: Option<String>,
    #[arg(long, num_args = 1..)]
    any_of: Option<Vec<String>>,
    #[arg(long, num_args = 1..)]
    none_of: Option<Vec<String>>,

    /// Iterate this index without a condition.
    #[arg(long, conflicts_with = "where_index")]
    order_by: Option<String>,

    #[arg(long)]
    reverse: bool,

    #[arg(long)]
    limit: Option<usize>,

    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Print the iterated index values instead of records.
    #[arg(long, conflicts_with_all = ["urls", "count"])]
    keys: bool,

    /// Print record URLs instead of records.
    #[arg(long, conflicts_with = "count")]
    urls: bool,

    /// Print only the number of matches.
    #[arg(long)]
    count: bool,
}

impl QueryArgs {
    fn into_request(self) -> QueryRequest {
        use query_cmd::parse_value as v;
        let parse_all = |raw: Vec<String>| raw.iter().map(|s| v(s)).collect::<Vec<_>>();

        let condition = if let Some(raw) = self.equals {
            Some(Condition::Equals(v(&raw)))
        } else if let Some(raw) = self.not_equal {
            Some(Condition::NotEqual(v(&raw)))
        } else if let Some(raw) = self.above {
            Some(Condition::Above(v(&raw)))
        } else if let Some(raw) = self.above_or_equal {
            Some(Condition::AboveOrEqual(v(&raw)))
        } else if let Some(raw) = self.below {
            Some(Condition::Below(v(&raw)))
        } else if let Some(raw) = self.below_or_equal {
            Some(Condition::BelowOrEqual(v(&raw)))
        } else if let Some(raw) = self.between {
            match raw.as_slice() {
                [lo, hi] => Some(Condition::Between(v(lo), v(hi))),
                _ => None,
            }
        } else if let Some(prefix) = self.starts_with {
            Some(Condition::StartsWith(prefix))
        } else if let Some(raw) = self.any_of {
            Some(Condition::AnyOf(parse_all(raw)))
        } else {
            self.none_of.map(|raw| Condition::NoneOf(parse_all(raw)))
        };

        QueryRequest {
            table: self.table,
            where_index: self.where_index,
            condition,
            order_by: self.order_by,
            reverse: self.reverse,
            limit: self.limit,
            offset: self.offset,
            output: if self.keys {
                Output::Keys
            } else if self.urls {
                Output::Urls
            } else if self.count {
                Output::Count
            } else {
                Output::Records
            },
        }
    }
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    match s {
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!(
            "invalid progress mode '{}': expected off, human, or json",
            other
        )),
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Drive {
        action: DriveAction::Init { dir },
    } = &cli.command
    {
        init_tracing("warn");
        index_cmd::run_drive_init(dir)?;
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.log.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            let (database, report) = db::open_database(&cfg).await?;
            database.close().await?;
            println!("Database initialized successfully.");
            for table in &report.rebuilds {
                println!("  rebuilt: {}", table);
            }
        }
        Commands::Drive { .. } => {}
        Commands::Index {
            dirs,
            no_snapshot,
            progress,
        } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            index_cmd::run_index(&cfg, &dirs, mode, !no_snapshot).await?;
        }
        Commands::Unindex { dirs } => {
            index_cmd::run_unindex(&cfg, &dirs).await?;
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Tables => {
            stats::run_tables(&cfg).await?;
        }
        Commands::Get { table, url } => {
            get::run_get(&cfg, &table, &url).await?;
        }
        Commands::Query(args) => {
            query_cmd::run_query(&cfg, &args.into_request()).await?;
        }
    }

    Ok(())
}
