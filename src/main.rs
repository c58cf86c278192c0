use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use reductoor::catalog::Catalog;
use reductoor::config::Config;
use reductoor::migrate::{Migrator, PgMigrator};
use reductoor::pipeline::Pipeline;
use reductoor::reduce;
use reductoor::store::PgStore;

/// Hardware telemetry collector and time-series reducer.
#[derive(Parser)]
#[command(name = "reductoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion pipeline (the default when no command is given).
    Run,
    /// Rewrite a window of stored rows as a change-of-value stream.
    Reduce(WindowArgs),
    /// Materialize bucketed statistics into the rollup tables.
    Rollup(WindowArgs),
    /// Rebuild one table's window as dense CSV on stdout.
    Reconstruct(ReconstructArgs),
    /// Score a dry-run reduction against the stored rows.
    Validate(WindowArgs),
    /// Apply or roll back database schema migrations.
    Migrate(MigrateArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
struct WindowArgs {
    /// Window start, RFC 3339 (e.g. 2026-08-01T00:00:00Z).
    #[arg(long)]
    start: String,

    /// Window end, RFC 3339, exclusive.
    #[arg(long)]
    end: String,

    /// Tables to process; every catalog table when omitted.
    #[arg(long = "table")]
    tables: Vec<String>,
}

#[derive(Args)]
struct ReconstructArgs {
    /// Window start, RFC 3339.
    #[arg(long)]
    start: String,

    /// Window end, RFC 3339, exclusive.
    #[arg(long)]
    end: String,

    /// Table to rebuild.
    #[arg(long)]
    table: String,
}

#[derive(Args)]
struct MigrateArgs {
    #[command(subcommand)]
    command: MigrateCommand,
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Apply all pending migrations.
    Up,
    /// Roll back the most recent migration.
    Down,
    /// Print the current schema version.
    Status,
}

/// Build-time version info, injected via the GIT_COMMIT env var.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("reductoor {}", version::full());
        return Ok(());
    }

    // Initialize tracing. Logs go to stderr so reconstruct can stream
    // CSV on stdout.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    // Config is required for everything past this point.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting reductoor",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command.unwrap_or(Command::Run) {
            Command::Run => run(cfg).await,
            Command::Reduce(args) => reduce_cmd(cfg, args).await,
            Command::Rollup(args) => rollup_cmd(cfg, args).await,
            Command::Reconstruct(args) => reconstruct_cmd(cfg, args).await,
            Command::Validate(args) => validate_cmd(cfg, args).await,
            Command::Migrate(args) => migrate_cmd(cfg, args.command).await,
            // Handled before the runtime starts.
            Command::Version => Ok(()),
        }
    })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Connect to the store and load the node and metric directories.
    let store = connect_store(&cfg).await?;

    let catalog = Catalog::load(store.pool()?)
        .await
        .context("loading catalog")?;

    // Start the pipeline.
    let store = Arc::new(store);
    let mut pipeline = Pipeline::new(cfg, Arc::new(catalog), store.clone())?;
    pipeline.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    pipeline.stop().await?;
    store.close().await;

    tracing::info!("reductoor stopped");

    Ok(())
}

/// Connects the store and applies pending migrations when configured.
async fn connect_store(cfg: &Config) -> Result<PgStore> {
    let mut store = PgStore::new(cfg.store.clone());
    store.start().await?;

    if cfg.store.migrations.enabled {
        let migrator = PgMigrator::new(store.pool()?.clone());
        migrator.up().await.context("applying migrations")?;
    }

    Ok(store)
}

/// Expands an explicit table list, or falls back to every catalog table.
async fn select_tables(store: &PgStore, requested: Vec<String>) -> Result<Vec<String>> {
    if !requested.is_empty() {
        return Ok(requested);
    }

    let catalog = Catalog::load(store.pool()?)
        .await
        .context("loading catalog")?;
    Ok(catalog.tables().to_vec())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp {s:?}, expected RFC 3339"))
}

fn parse_window(args: &WindowArgs) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    Ok((parse_ts(&args.start)?, parse_ts(&args.end)?))
}

async fn reduce_cmd(cfg: Config, args: WindowArgs) -> Result<()> {
    let (start, end) = parse_window(&args)?;
    let store = connect_store(&cfg).await?;
    let tables = select_tables(&store, args.tables).await?;

    let outcomes = reduce::run_reduce(&store, &tables, start, end, &cfg.reduction).await?;
    for o in &outcomes {
        println!("{}: {} -> {} rows", o.table, o.rows_before, o.rows_after);
    }

    store.close().await;
    Ok(())
}

async fn rollup_cmd(cfg: Config, args: WindowArgs) -> Result<()> {
    let (start, end) = parse_window(&args)?;
    let store = connect_store(&cfg).await?;
    let tables = select_tables(&store, args.tables).await?;

    let outcomes = reduce::run_rollup(&store, &tables, start, end, &cfg.reduction).await?;
    for o in &outcomes {
        println!(
            "{} -> {}: {} buckets, {} gaps",
            o.table, o.rollup_table, o.buckets_written, o.gap_buckets,
        );
    }

    store.close().await;
    Ok(())
}

async fn reconstruct_cmd(cfg: Config, args: ReconstructArgs) -> Result<()> {
    let start = parse_ts(&args.start)?;
    let end = parse_ts(&args.end)?;
    let store = connect_store(&cfg).await?;

    let mut out = std::io::stdout().lock();
    let rows =
        reduce::run_reconstruct(&store, &args.table, start, end, &cfg.reduction, &mut out).await?;
    out.flush().context("flushing stdout")?;

    store.close().await;
    tracing::info!(table = %args.table, rows, "reconstruction written");
    Ok(())
}

async fn validate_cmd(cfg: Config, args: WindowArgs) -> Result<()> {
    let (start, end) = parse_window(&args)?;
    let store = connect_store(&cfg).await?;
    let tables = select_tables(&store, args.tables).await?;

    let reports = reduce::run_validate(&store, &tables, start, end, &cfg.reduction).await?;
    store.close().await;

    let mut failed = 0usize;
    for r in &reports {
        let verdict = if r.within(cfg.reduction.error_bound_pct) {
            "ok"
        } else {
            failed += 1;
            "ABOVE BOUND"
        };
        println!(
            "{}: {} series, mean {:.3}% worst {:.3}% [{}]",
            r.table, r.series_scored, r.mean_error_pct, r.worst_error_pct, verdict,
        );
    }

    if failed > 0 {
        bail!(
            "{failed} of {} table(s) exceed the {}% error bound",
            reports.len(),
            cfg.reduction.error_bound_pct,
        );
    }

    Ok(())
}

async fn migrate_cmd(cfg: Config, command: MigrateCommand) -> Result<()> {
    let mut store = PgStore::new(cfg.store.clone());
    store.start().await?;
    let migrator = PgMigrator::new(store.pool()?.clone());

    match command {
        MigrateCommand::Up => migrator.up().await?,
        MigrateCommand::Down => migrator.down().await?,
        MigrateCommand::Status => {
            let (ver, dirty) = migrator.status().await?;
            println!("{ver}{}", if dirty { " (dirty)" } else { "" });
        }
    }

    store.close().await;
    Ok(())
}
