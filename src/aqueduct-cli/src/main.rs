//! Aqueduct command-line client
//!
//! Runs AQL queries and inspects deployments from the shell. Query results
//! are printed as one JSON document per line.

mod telemetry;

use anyhow::{anyhow, Context, Result};
use aqueduct_core::{AqlQuery, Config, LoadBalancingStrategy, QueryOptions};
use aqueduct_rs::Database;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "aqueduct")]
#[command(version, about = "Aqueduct database client")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server URL; repeat for several coordinators
    #[arg(short, long)]
    url: Vec<String>,

    /// Database name
    #[arg(short, long)]
    database: Option<String>,

    #[arg(long, value_enum)]
    load_balancing: Option<Strategy>,

    /// Directory for log files
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// More log output; repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an AQL query and print every result
    Query {
        query: String,

        /// Bind parameter as name=value; values are parsed as JSON, falling back to strings
        #[arg(short, long = "bind", value_parser = parse_bind)]
        bind: Vec<(String, Value)>,

        #[arg(long)]
        batch_size: Option<u32>,

        /// Allow reads from followers
        #[arg(long)]
        dirty_read: bool,
    },

    /// Print the server version
    Version,

    /// Fetch the cluster endpoint list and print it
    Endpoints {
        /// Replace the configured hosts instead of extending them
        #[arg(long)]
        overwrite: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Strategy {
    None,
    OneRandom,
    RoundRobin,
}

impl From<Strategy> for LoadBalancingStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::None => LoadBalancingStrategy::None,
            Strategy::OneRandom => LoadBalancingStrategy::OneRandom,
            Strategy::RoundRobin => LoadBalancingStrategy::RoundRobin,
        }
    }
}

fn parse_bind(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{}`", raw))?;
    if name.is_empty() {
        return Err("bind parameter name must not be empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(&path.to_string_lossy())?,
        None => Config::default(),
    };
    if !args.url.is_empty() {
        config = config.with_urls(args.url.iter().cloned());
    }
    if let Some(database) = &args.database {
        config = config.with_database(database.clone());
    }
    if let Some(strategy) = args.load_balancing {
        config = config.with_load_balancing(strategy.into());
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = telemetry::init_telemetry(&args.log_dir, args.verbose)?;

    let config = load_config(&args)?;
    tracing::info!(
        "Connecting to {:?} (database {})",
        config.url,
        config.database_name
    );
    let db = Database::new(&config).context("Failed to create client")?;

    let result = run(&db, args.command).await;
    db.connection().close();
    result
}

async fn run(db: &Database, command: Command) -> Result<()> {
    match command {
        Command::Query {
            query,
            bind,
            batch_size,
            dirty_read,
        } => {
            let bind_vars: Map<String, Value> = bind.into_iter().collect();
            let query = AqlQuery::new(query, bind_vars)?;

            let mut options = QueryOptions::default().with_dirty_read(dirty_read);
            if let Some(size) = batch_size {
                options = options.with_batch_size(size);
            }

            let mut cursor = db
                .query::<Value>(&query, options)
                .await
                .context("Query failed")?;
            let mut rows = 0usize;
            while let Some(row) = cursor.next().await? {
                println!("{}", serde_json::to_string(&row)?);
                rows += 1;
            }

            for warning in &cursor.extra().warnings {
                tracing::warn!("Query warning {}: {}", warning.code, warning.message);
            }
            tracing::info!("{} row(s)", rows);
        }
        Command::Version => {
            let version = db.version().await.context("Failed to fetch server version")?;
            println!("{}", serde_json::to_string(&version)?);
        }
        Command::Endpoints { overwrite } => {
            let endpoints = db
                .acquire_host_list(overwrite)
                .await
                .context("Failed to fetch cluster endpoints")?;
            if endpoints.is_empty() {
                return Err(anyhow!("no endpoints reported"));
            }
            for endpoint in endpoints {
                println!("{}", endpoint);
            }
        }
    }
    Ok(())
}
