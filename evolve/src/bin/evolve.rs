use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use evolve::mem::InMemoryLogStore;
use evolve::migrations;
use evolve::prelude::*;

/// Migrates an event log to the latest migration index.
#[derive(Parser, Debug)]
#[command(name = "evolve", version, about = "Event log migration tool")]
struct Cli {
    /// JSON file holding the position log. Takes precedence over --database-url
    #[arg(long, global = true)]
    file: Option<PathBuf>,

    /// Postgres connection string
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Compare the rewritten projection with a fresh replay after every step
    #[arg(long, global = true)]
    verify: bool,

    /// Log progress every this many positions, 0 disables it
    #[arg(long, global = true, default_value_t = 1_000)]
    progress_interval: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run pending migrations into staging without touching the live log
    Migrate,
    /// Run pending migrations and make the result the live log
    Finalize,
    /// Run pending migrations in memory and print the rewritten log
    Preview,
    /// Show the stored and latest migration index and the staging phase
    Status,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is not a position log: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },
    #[error("no log given, pass --file or --database-url")]
    NoLog,
    #[cfg(not(feature = "postgres"))]
    #[error("this build has no postgres support, rebuild with the `postgres` feature")]
    NoPostgres,
    #[cfg(feature = "postgres")]
    #[error("cannot connect to postgres: {0}")]
    Connect(#[from] sqlx::Error),
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] evolve::pg::PgLogStoreError),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Engine(e) => e.exit_code(),
            CliError::Registry(_) => 1,
            _ => 2,
        }
    }
}

fn read_log(path: &Path) -> Result<Vec<Position>, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| CliError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    decode_log(value).map_err(|e| CliError::Decode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_log(path: &Path, positions: &[Position]) -> Result<(), CliError> {
    let write_error = |source| CliError::Write {
        path: path.to_path_buf(),
        source,
    };
    let text = serde_json::to_string_pretty(&encode_log(positions))
        .map_err(|e| write_error(std::io::Error::other(e)))?;
    std::fs::write(path, text + "\n").map_err(write_error)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".staging.json");
    PathBuf::from(name)
}

fn format_mi(mi: Option<i32>) -> String {
    mi.map_or_else(|| "-".to_string(), |mi| mi.to_string())
}

/// Runs `command` and prints its outcome.
async fn execute<B: LogStoreBackend>(
    engine: &MigrationEngine<B>,
    command: Command,
) -> Result<(), CliError> {
    match command {
        Command::Status => {
            let status = engine.status().await?;
            println!("stored migration index: {}", format_mi(status.stored_mi));
            println!("latest migration index: {}", format_mi(status.max_target_mi));
            let pending: Vec<_> = status.pending.iter().map(i32::to_string).collect();
            println!(
                "pending: {}",
                if pending.is_empty() {
                    "none".to_string()
                } else {
                    pending.join(", ")
                }
            );
            println!("staging: {}", status.phase);
            println!("positions: {}", status.positions);
        }
        Command::Preview => {
            let outcome = engine.preview().await?;
            let text = serde_json::to_string_pretty(&encode_log(&outcome.positions))
                .map_err(|e| CliError::Decode {
                    path: PathBuf::from("-"),
                    reason: e.to_string(),
                })?;
            println!("{text}");
        }
        Command::Migrate => {
            let outcome = engine.migrate().await?;
            if outcome.is_noop() {
                println!("nothing to migrate");
            } else {
                println!(
                    "staged migration indices {:?} over {} positions",
                    outcome.applied,
                    outcome.positions.len()
                );
            }
        }
        Command::Finalize => {
            let outcome = engine.finalize().await?;
            if outcome.resumed {
                println!(
                    "resumed finalize at migration index {}",
                    format_mi(outcome.to_mi)
                );
            } else if outcome.is_noop() {
                println!("nothing to migrate");
            } else {
                println!(
                    "finalized at migration index {} ({} positions)",
                    format_mi(outcome.to_mi),
                    outcome.positions.len()
                );
            }
        }
    }
    Ok(())
}

/// Cancels the engine on Ctrl-C.
fn cancel_on_interrupt(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, stopping before the next position");
            handle.cancel();
        }
    });
}

async fn run_file(cli: &Cli, path: &Path, config: EngineConfig) -> Result<(), CliError> {
    let store = InMemoryLogStore::with_positions(read_log(path)?);
    let engine =
        MigrationEngine::new(store.clone(), migrations::registry()?).with_config(config);
    cancel_on_interrupt(engine.cancel_handle());
    execute(&engine, cli.command).await?;

    match cli.command {
        Command::Finalize => write_log(path, &store.positions().await)?,
        Command::Migrate => {
            if let Some(staged) = store.staged_positions().await {
                let target = staging_path(path);
                write_log(&target, &staged)?;
                println!("staging written to {}", target.display());
            }
        }
        Command::Preview | Command::Status => {}
    }
    Ok(())
}

#[cfg(feature = "postgres")]
async fn run_postgres(cli: &Cli, url: &str, config: EngineConfig) -> Result<(), CliError> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(url)
        .await?;
    let store = evolve::pg::PgLogStore::new(pool);
    store.initialize().await?;
    let engine = MigrationEngine::new(store, migrations::registry()?).with_config(config);
    cancel_on_interrupt(engine.cancel_handle());
    execute(&engine, cli.command).await
}

#[cfg(not(feature = "postgres"))]
async fn run_postgres(_cli: &Cli, _url: &str, _config: EngineConfig) -> Result<(), CliError> {
    Err(CliError::NoPostgres)
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = EngineConfig {
        progress_interval: cli.progress_interval,
        verify_projection: cli.verify,
    };
    log::debug!("Running {:?} with {config:?}", cli.command);
    match (&cli.file, &cli.database_url) {
        (Some(path), _) => run_file(&cli, path, config).await,
        (None, Some(url)) => run_postgres(&cli, url, config).await,
        (None, None) => Err(CliError::NoLog),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    if let Err(err) = run(cli).await {
        log::error!("{err}");
        eprintln!("error: {err}");
        process::exit(err.exit_code());
    }
}
