//! mysql-migrate CLI

use clap::{Parser, Subcommand};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use mysql_migrate::config::{LogFormat, split_object_list};
use mysql_migrate::{Error, MigrateConfig, MigrationResult, Migrator, ObjectOutcome, TransferProgress};
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_CONFIG_FILES: [&str; 2] = ["mysql-migrate.toml", ".mysql-migrate.toml"];

#[derive(Parser)]
#[command(name = "mysql-migrate")]
#[command(author, version, about = "Copy MySQL schema and data between databases")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (default: from config, else info)
    #[arg(long, global = true, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration (default)
    Migrate(MigrateArgs),
    /// Test connectivity to both databases
    Test,
    /// Show the objects that would be migrated, in order
    Plan,
    /// Generate sample config
    Init {
        #[arg(short, long, default_value = "mysql-migrate.toml")]
        output: String,
    },
}

#[derive(clap::Args, Default)]
struct MigrateArgs {
    /// Comma-separated objects to migrate, in order (default: all)
    #[arg(long)]
    objects: Option<String>,

    /// Rows per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Concurrent table transfers
    #[arg(long)]
    workers: Option<usize>,

    /// Stop after this long, e.g. "30m"
    #[arg(long)]
    timeout: Option<String>,

    /// Leave data of tables that already existed untouched
    #[arg(long)]
    skip_existing_data: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("Error: {}", e);
            eprintln!("{} {}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Init doesn't need config
    if let Some(Commands::Init { output }) = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"), cli.quiet, cli.json);
        run_init(output)?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(cli.config.as_deref())?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(
        &level,
        cli.quiet,
        cli.json || config.logging.format == LogFormat::Json,
    );

    match cli.command {
        None => run_migrate(config, MigrateArgs::default(), cli.json, cli.quiet).await,
        Some(Commands::Migrate(args)) => run_migrate(config, args, cli.json, cli.quiet).await,
        Some(Commands::Test) => run_test(config, cli.json).await,
        Some(Commands::Plan) => run_plan(config, cli.json).await,
        Some(Commands::Init { .. }) => Ok(ExitCode::SUCCESS),
    }
}

// Runs before logging is set up, so nothing here logs
fn load_config(path: Option<&str>) -> Result<MigrateConfig, Box<dyn std::error::Error>> {
    if let Some(p) = path {
        return Ok(MigrateConfig::from_file(p)?);
    }

    for default in &DEFAULT_CONFIG_FILES {
        if std::path::Path::new(default).exists() {
            return Ok(MigrateConfig::from_file(default)?);
        }
    }

    Ok(MigrateConfig::from_env()?)
}

fn apply_overrides(config: &mut MigrateConfig, args: MigrateArgs) {
    if let Some(objects) = args.objects {
        config.migration.objects = split_object_list(&objects);
    }
    if let Some(size) = args.batch_size {
        config.migration.batch_size = size;
    }
    if let Some(workers) = args.workers {
        config.migration.workers = workers;
    }
    if args.timeout.is_some() {
        config.migration.timeout = args.timeout;
    }
    if args.skip_existing_data {
        config.migration.skip_existing_data = true;
    }
}

async fn run_migrate(
    mut config: MigrateConfig,
    args: MigrateArgs,
    json: bool,
    quiet: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    apply_overrides(&mut config, args);

    if !quiet && !json {
        println!("mysql-migrate v{}", mysql_migrate::VERSION);
        println!(
            "{} -> {}\n",
            config.source.display_name(),
            config.destination.display_name()
        );
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight batches...");
            on_interrupt.cancel();
        }
    });

    let bars = ProgressBars::new(quiet || json);
    let reporter = bars.clone();
    let migrator = Migrator::new(config)?
        .with_cancellation(cancel)
        .with_progress(move |p| reporter.update(p));

    let result = migrator.run().await?;
    bars.finish();

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !quiet {
        print_summary(&result);
    }

    Ok(ExitCode::from(result.exit_code() as u8))
}

async fn run_test(
    config: MigrateConfig,
    json: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    if !json {
        println!("Testing connectivity...\n");
    }

    Migrator::new(config)?.test_connectivity().await?;

    if json {
        println!(r#"{{"source":"ok","destination":"ok"}}"#);
    } else {
        println!("\n{} All connectivity tests passed!", style("✓").green());
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_plan(
    config: MigrateConfig,
    json: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let planned = Migrator::new(config)?.plan().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&planned)?);
    } else {
        println!("Migration plan\n");
        for (i, object) in planned.iter().enumerate() {
            match object.kind {
                Some(kind) => println!("  {:>3}. {:<5} {}", i + 1, kind.to_string(), object.name),
                None => println!(
                    "  {:>3}. {}",
                    i + 1,
                    style(format!("{} (not found on source)", object.name)).red()
                ),
            }
        }
        println!("\nTotal: {} objects", planned.len());
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(result: &MigrationResult) {
    if result.is_success() {
        println!("{} Migration completed successfully", style("✓").green());
    } else if result.cancelled {
        println!("{} Migration cancelled", style("✗").red());
    } else {
        println!("{} Migration completed with errors", style("✗").red());
    }
    println!("\nDuration: {}ms", result.duration_ms);
    println!(
        "Rows: {} read, {} written, {} failed ({:.0} rows/s, {:.1}% of batches ok)\n",
        result.total_read(),
        result.total_written(),
        result.total_failed(),
        result.metrics.rows_per_second(result.duration_ms),
        result.metrics.batch_success_rate() * 100.0
    );

    for object in &result.objects {
        let outcome = object.outcome();
        let icon = match outcome {
            ObjectOutcome::Migrated => style("✓").green(),
            ObjectOutcome::SkippedExisting => style("-").cyan(),
            ObjectOutcome::Partial => style("~").yellow(),
            ObjectOutcome::NotMigrated => style("✗").red(),
        };
        if object.kind.has_data() && !object.data_skipped {
            println!(
                "  {} {} {}: {} ({} of {} rows, {}ms)",
                icon,
                object.kind,
                object.name,
                outcome,
                object.rows.written,
                object.rows.read,
                object.duration_ms
            );
        } else {
            println!("  {} {} {}: {}", icon, object.kind, object.name, outcome);
        }
        for batch in &object.batch_errors {
            println!("      {} ({} rows)", Error::from(batch), batch.rows);
        }
        if let Some(ref e) = object.error {
            println!("      Error: {}", e);
        }
    }
}

/// One spinner per table being transferred.
#[derive(Clone)]
struct ProgressBars {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
}

impl ProgressBars {
    fn new(hidden: bool) -> Self {
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn update(&self, progress: TransferProgress) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        let bar = bars.entry(progress.table.clone()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_style(
                ProgressStyle::with_template("{spinner:.green} {prefix:.bold} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_prefix(progress.table.clone());
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
        bar.set_message(format!(
            "batch {}: {} read, {} written, {} failed",
            progress.batch, progress.rows_read, progress.rows_written, progress.rows_failed
        ));
    }

    fn finish(&self) {
        if let Ok(bars) = self.bars.lock() {
            for bar in bars.values() {
                bar.finish();
            }
        }
    }
}

fn run_init(output: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = r#"# mysql-migrate configuration

[source]
host = "old-db.internal"
port = 3306
user = "migrate"
password = "change-me"
database = "shop"
ssl_mode = "prefer"

[destination]
host = "new-db.internal"
port = 3306
user = "migrate"
password = "change-me"
database = "shop"
ssl_mode = "prefer"
max_retries = 5

[migration]
# Empty list migrates every table and view, tables first
objects = []
batch_size = 1000
workers = 4
# timeout = "30m"
skip_existing_data = false
strip_table_options = true
disable_foreign_key_checks = true

[retry]
initial_backoff_ms = 500
max_backoff_ms = 30000
multiplier = 2.0

[logging]
level = "info"
format = "text"
"#;

    std::fs::write(output, config)?;
    println!("{} Created: {}", style("✓").green(), output);
    println!("\nEdit the file or use environment variables:");
    println!("  SOURCE_DATABASE_URL, DEST_DATABASE_URL, MIGRATE_OBJECTS");
    Ok(())
}

fn init_logging(level: &str, quiet: bool, json_output: bool) {
    if quiet {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so stdout stays clean for the report
    if json_output {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}
