//! dwh-ingest - load goodbooks exports into the warehouse

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dwh_common::logging::{init_logging, LogConfig, LogLevel};
use dwh_ingest::schema::{Aggregation, BuiltinTarget};
use dwh_ingest::{pipeline, LoadConfig, MemoryWarehouse, PgWarehouse, RunReport, Warehouse, WarehouseConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "dwh-ingest")]
#[command(author, version, about = "Staged, idempotent loads of the goodbooks dataset")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the run report as JSON on stdout
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a source file into a target
    Load {
        #[arg(value_enum)]
        target: BuiltinTarget,

        /// Delimited source file with a header row
        #[arg(short, long)]
        source: PathBuf,

        /// Rows per batch (default depends on the target)
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Only load the first N data rows
        #[arg(short, long)]
        limit: Option<u64>,

        /// Reduction for duplicate ratings: max, min or latest
        #[arg(long)]
        aggregate: Option<Aggregation>,

        /// Field delimiter
        #[arg(long, default_value_t = ',')]
        delimiter: char,

        /// Run against an in-memory warehouse, without a database
        #[arg(long)]
        dry_run: bool,
    },

    /// List the built-in targets
    Targets,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the environment may already be set
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let _guard = init_logging(&log_config(cli.verbose)?)?;

    match cli.command {
        Command::Targets => list_targets(),
        Command::Load {
            target,
            source,
            batch_size,
            limit,
            aggregate,
            delimiter,
            dry_run,
        } => {
            let mut config = LoadConfig::from_env().context("Invalid load configuration")?;
            if batch_size.is_some() {
                config.batch_size = batch_size;
            }
            if let Some(aggregation) = aggregate {
                config.aggregation = aggregation;
            }
            if !delimiter.is_ascii() {
                bail!("Delimiter must be a single ASCII character, got '{}'", delimiter);
            }
            config.delimiter = delimiter as u8;
            config.limit = limit;
            let config = config.validate()?;

            let warehouse: Box<dyn Warehouse> = if dry_run {
                info!("Dry run: using the in-memory warehouse");
                Box::new(MemoryWarehouse::new())
            } else {
                let db = WarehouseConfig::from_env().context("Invalid warehouse configuration")?;
                Box::new(
                    PgWarehouse::connect(&db)
                        .await
                        .with_context(|| format!("Cannot reach warehouse at {}", db.describe()))?,
                )
            };

            let schema = target.schema(config.aggregation)?;
            match pipeline::run(warehouse.as_ref(), &schema, &config, &source).await {
                Ok(report) => print_report(&report, cli.json),
                Err(e) => {
                    error!(error = %e, "Load failed");
                    if let Some(report) = e.partial_report() {
                        print_report(report, cli.json)?;
                    }
                    Err(e).with_context(|| format!("Loading {} failed", source.display()))
                },
            }
        },
    }
}

/// Environment settings first, then `--verbose` on top
fn log_config(verbose: bool) -> Result<LogConfig> {
    let mut config = LogConfig::builder()
        .log_file_prefix("dwh-ingest")
        .build()
        .merge_env()?;
    if verbose {
        config.level = LogLevel::Debug;
    }
    Ok(config)
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

fn list_targets() -> Result<()> {
    for target in BuiltinTarget::all() {
        let schema = target.schema(Aggregation::default())?;
        println!(
            "{:<18} {:<28} -> {:<22} key ({}) {}",
            schema.name,
            schema.staging.to_string(),
            schema.target.to_string(),
            schema.key.join(", "),
            schema.policy.label()
        );
    }
    Ok(())
}
