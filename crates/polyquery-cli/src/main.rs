//! polyquery CLI - query and inspect configured database connections
//!
//! Connections are read from a YAML or JSON file. Every command opens the
//! connection it names, runs, and closes all connections before exiting.

mod commands;
mod config;
mod session;

use clap::{Parser, Subcommand};
use commands::{
    BackendsCommand, ColumnsCommand, DatabasesCommand, HelpersCommand, QueryCommand,
    SchemaCommand,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "POLYQUERY_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "POLYQUERY_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    /// Connection config file (YAML, or JSON by extension)
    #[arg(
        long,
        default_value = "polyquery.yaml",
        env = "POLYQUERY_CONFIG",
        global = true
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query and print rows as JSON lines
    Query(QueryCommand),
    /// Print the schema of a connection
    Schema(SchemaCommand),
    /// Print the columns of a table
    Columns(ColumnsCommand),
    /// Print helper queries for a table
    Helpers(HelpersCommand),
    /// List databases (catalogs) of a connection
    Databases(DatabasesCommand),
    /// List supported backend types
    Backends(BackendsCommand),
}

fn init_tracing(log_level: &str, log_format: &str) -> anyhow::Result<()> {
    // If RUST_LOG is set, use it directly; otherwise use our default filter
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::try_from_default_env()?
    } else {
        // polyquery crates at the requested level, noisy dependencies at warn
        tracing_subscriber::EnvFilter::try_new(format!(
            "polyquery={level},\
             polyquery_cli={level},\
             polyquery_postgres={level},\
             polyquery_redis={level},\
             polyquery_databricks={level},\
             tokio_postgres=warn,\
             redis=warn,\
             reqwest=warn,\
             hyper=warn,\
             h2=warn,\
             rustls=warn",
            level = log_level
        ))?
    };

    // Logs go to stderr, stdout carries results
    let fmt_layer = match log_format {
        "full" => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer() // "compact" or any other value
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, &cli.log_format)?;

    match cli.command {
        Commands::Query(cmd) => cmd.execute(&cli.config),
        Commands::Schema(cmd) => cmd.execute(&cli.config),
        Commands::Columns(cmd) => cmd.execute(&cli.config),
        Commands::Helpers(cmd) => cmd.execute(&cli.config),
        Commands::Databases(cmd) => cmd.execute(&cli.config),
        Commands::Backends(cmd) => cmd.execute(),
    }
}
