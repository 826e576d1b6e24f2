//! tsmfix command-line interface.
//!
//! Applies the rules declared in a TOML configuration file to the TSM and
//! WAL files of the selected shards. Run with `--check` for a read-only
//! dry run, and `list-rules` to print every registered rule with a sample
//! configuration.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tsmfix_core::{
    load_config, load_shards, ByteSize, CoreError, LogBuffer, Pipeline, RuleRegistry,
    DEFAULT_CACHE_SNAPSHOT_BYTES, DEFAULT_MAX_CACHE_BYTES,
};

/// Apply rules to TSM and WAL files.
#[derive(Parser)]
#[command(name = "tsmfix")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to data storage
    #[arg(long, default_value = "/var/lib/tsmfix/data")]
    datadir: PathBuf,

    /// Path to WAL storage
    #[arg(long, default_value = "/var/lib/tsmfix/wal")]
    waldir: PathBuf,

    /// The database to fix
    #[arg(long)]
    database: Option<String>,

    /// The retention policy to fix (requires --database)
    #[arg(long)]
    retention: Option<String>,

    /// The id of the shard to fix
    #[arg(long)]
    shard: Option<String>,

    /// The maximum in-memory cache size (supports K/M/G/T/P suffixes)
    #[arg(long, default_value_t = ByteSize(DEFAULT_MAX_CACHE_BYTES))]
    max_cache_size: ByteSize,

    /// The size after which the cache is snapshotted to disk while
    /// re-writing TSM files
    #[arg(long, default_value_t = ByteSize(DEFAULT_CACHE_SNAPSHOT_BYTES))]
    cache_snapshot_size: ByteSize,

    /// The rules configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run in check mode (do not apply any change)
    #[arg(long)]
    check: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List every registered rule with a sample configuration
    ListRules,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CoreError> {
    if let Some(Commands::ListRules) = cli.command {
        let mut stdout = io::stdout();
        RuleRegistry::builtin().print_list(&mut stdout)?;
        return Ok(());
    }

    let Some(config) = cli.config.as_deref() else {
        return Err(CoreError::invalid_value(
            "config",
            "must specify a configuration file",
        ));
    };
    if cli.retention.is_some() && cli.database.is_none() {
        return Err(CoreError::invalid_value(
            "retention",
            "must specify a database",
        ));
    }

    confirm_root()?;

    if cli.check {
        println!("Running in check mode");
    }

    let log = LogBuffer::new();
    let rules = load_config(config, &log)?;

    let shards = load_shards(
        &cli.datadir,
        &cli.waldir,
        cli.database.as_deref(),
        cli.retention.as_deref(),
        cli.shard.as_deref(),
    )?;

    let mut pipeline = Pipeline::new(rules, log)
        .with_check_mode(cli.check)
        .with_cache_sizes(cli.max_cache_size.as_u64(), cli.cache_snapshot_size.as_u64());

    pipeline.run(&shards)?;

    let mut stdout = io::stdout();
    pipeline.flush_log(&mut stdout)?;
    stdout.flush()?;

    Ok(())
}

/// Asks for confirmation when running as root: files rewritten with root
/// ownership become unreadable to the database's own user.
fn confirm_root() -> Result<(), CoreError> {
    let is_root = std::env::var("USER").map(|u| u == "root").unwrap_or(false);
    if !is_root {
        return Ok(());
    }

    println!(
        "You are currently running tsmfix as root. This will write all your\n\
         TSM and WAL files with root ownership and they will be inaccessible\n\
         if you run the database as a non-root user. You should run tsmfix\n\
         as the same user you are running the database (eg sudo -u tsdb tsmfix [...])"
    );
    print!("Are you sure you want to continue? (yN): ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    if answer.trim().to_lowercase().starts_with('y') {
        Ok(())
    } else {
        Err(CoreError::Aborted)
    }
}
