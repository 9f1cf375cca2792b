use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufRead, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use rollupd::agent::Agent;
use rollupd::config::Config;
use rollupd::migrate::Migrator;
use rollupd::store::sqlite::SqliteStore;
use rollupd::{RecordQuery, Resolution};

/// Multi-resolution rollup daemon.
#[derive(Parser)]
#[command(name = "rollupd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Default: the config's log_level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Roll up newline-delimited JSON source events (default command).
    Ingest {
        /// Input file, or "-" for stdin.
        #[arg(short, long, default_value = "-")]
        input: String,
    },
    /// Print decorated rollup records as JSON lines.
    Query {
        /// Series to read.
        #[arg(short, long)]
        series: String,

        /// Only this resolution.
        #[arg(short, long)]
        resolution: Option<Resolution>,

        /// Inclusive lower bound on bucket start (RFC 3339).
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Exclusive upper bound on bucket start (RFC 3339).
        #[arg(long)]
        to: Option<DateTime<Utc>>,

        /// Key filter as name=value; value is parsed as JSON, else a string.
        #[arg(short, long = "key", value_parser = parse_key_filter)]
        keys: Vec<(String, Value)>,
    },
    /// Apply SQLite schema migrations and print the schema version.
    Migrate {
        /// Roll back the most recent migration instead.
        #[arg(long)]
        down: bool,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn parse_key_filter(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw}"))?;
    if name.is_empty() {
        return Err(format!("empty key name in {raw}"));
    }
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("rollupd {}", version::full());
        return Ok(());
    }

    // Config is required for every other command.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let command = cli.command.unwrap_or(Command::Ingest {
        input: "-".to_string(),
    });

    rt.block_on(async {
        match command {
            Command::Ingest { input } => ingest(cfg, &input).await,
            Command::Query {
                series,
                resolution,
                from,
                to,
                keys,
            } => {
                let mut query = RecordQuery::series(series).between(from, to);
                query.resolution = resolution;
                query.key.extend(keys);
                self::query(cfg, query).await
            }
            Command::Migrate { down } => migrate(cfg, down).await,
            Command::Version => Ok(()),
        }
    })
}

async fn ingest(cfg: Config, input: &str) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting rollupd",
    );

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if input == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("opening input {input}"))?;
        Box::new(BufReader::new(file))
    };

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    // Set up signal handling.
    let cancel = agent.cancel_token();
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!(error = %e, "failed to register SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        cancel.cancel();
    });

    let result = agent.ingest(reader).await;

    // Graceful shutdown.
    agent.stop().await?;

    let stats = result?;
    tracing::info!(events = stats.events, "rollupd stopped");

    Ok(())
}

async fn query(cfg: Config, query: RecordQuery) -> Result<()> {
    if cfg.store.backend == rollupd::config::StoreBackend::Memory {
        tracing::warn!("memory store starts empty; query an sqlite store to read persisted rollups");
    }

    let agent = Agent::new(cfg)?;
    let engine = agent.build_engine()?;

    for record in engine.find(&query).await? {
        println!(
            "{}",
            serde_json::to_string(&record).context("encoding record")?
        );
    }

    Ok(())
}

async fn migrate(mut cfg: Config, down: bool) -> Result<()> {
    if cfg.store.backend != rollupd::config::StoreBackend::Sqlite {
        bail!("migrate requires store.backend: sqlite");
    }

    // Migrations run explicitly below.
    cfg.store.sqlite.migrations.enabled = false;
    let store = SqliteStore::open(&cfg.store.sqlite)?;
    let migrator = store.migrator();

    if down {
        migrator.down().await.context("rolling back migration")?;
    } else {
        migrator.up().await.context("applying migrations")?;
    }

    let (version, dirty) = migrator.status().await?;
    println!("schema version {version}{}", if dirty { " (dirty)" } else { "" });

    Ok(())
}
