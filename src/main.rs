use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use feed_relay::admin;
use feed_relay::config::{self, LoggingConfig, RelayConfig};
use feed_relay::dispatch::Dispatcher;
use feed_relay::engine::Engine;
use feed_relay::link_checker::{self, LinkCheckRunner};
use feed_relay::store::{LibSqlBackend, Store};
use feed_relay::transport::{TelegramTransport, Transport};

/// How often the link check scheduler looks at the clock.
const SCHEDULER_TICK: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "feed-relay", version, about = "Multi-source message forwarding relay")]
struct Cli {
    /// Path to the TOML config (falls back to RELAY_CONFIG, then ./relay.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay until interrupted (default).
    Run,
    /// Validate the config file and exit.
    CheckConfig,
    /// Run one link check against the default target and print the report.
    CheckLinks,
    /// Print resolved source and target identifiers as JSON.
    Export,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = config::config_path(cli.config);

    let config = RelayConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    let _log_guard = init_tracing(&config.logging);

    match cli.command.unwrap_or(Command::Run) {
        Command::CheckConfig => {
            eprintln!(
                "{}: {} account(s), {} source(s), {} rule(s)",
                path.display(),
                config.accounts.len(),
                config.sources.len(),
                config.targets.rules.len()
            );
            Ok(())
        }
        Command::CheckLinks => {
            let engine = start_engine(config, path).await?;
            let report = engine.trigger_link_check().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Export => {
            let engine = start_engine(config, path).await?;
            println!("{}", serde_json::to_string_pretty(&engine.export_dialogs())?);
            Ok(())
        }
        Command::Run => run(config, path).await,
    }
}

async fn run(config: RelayConfig, path: PathBuf) -> anyhow::Result<()> {
    let admin_bind = config.admin.enabled.then(|| config.admin.bind.clone());
    let engine = start_engine(config, path).await?;

    eprintln!("📡 Feed Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mode: {}", engine.snapshot().mode);
    eprintln!("   Sources: {}", engine.export_sources().len());

    // ── Link checker ────────────────────────────────────────────────────
    let link_checker_config = engine.snapshot().link_checker.clone();
    let scheduler = if link_checker_config.enabled {
        let runner: Arc<dyn LinkCheckRunner> = engine.clone();
        let (handle, shutdown) = link_checker::spawn_link_check_scheduler(
            runner,
            &link_checker_config.schedule,
            SCHEDULER_TICK,
        )?;
        eprintln!("   Link checks: {}", link_checker_config.schedule);
        Some((handle, shutdown))
    } else {
        eprintln!("   Link checks: disabled");
        None
    };

    // ── Admin ───────────────────────────────────────────────────────────
    if let Some(bind) = admin_bind {
        let addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("admin bind address '{bind}'"))?;
        let (_handle, local) = admin::spawn_admin_server(Arc::clone(&engine), addr).await?;
        eprintln!("   Admin: http://{local}");
    }

    // ── Dispatcher ──────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
        }
        let _ = stop_tx.send(true);
    });

    Dispatcher::new(Arc::clone(&engine)).run(stop_rx).await?;

    if let Some((handle, shutdown)) = scheduler {
        shutdown.store(true, Ordering::Relaxed);
        handle.abort();
    }
    Ok(())
}

async fn start_engine(config: RelayConfig, path: PathBuf) -> anyhow::Result<Arc<Engine>> {
    let store: Arc<dyn Store> = Arc::new(
        LibSqlBackend::new_local(&config.storage.path)
            .await
            .with_context(|| format!("opening database at {}", config.storage.path.display()))?,
    );
    let transport: Arc<dyn Transport> = Arc::new(TelegramTransport::new());
    let engine = Engine::start(config, Some(path), transport, store).await?;
    Ok(engine)
}

/// Console logging, plus a daily-rotated file when `file_dir` is set.
/// `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let (file_layer, guard) = match logging.file_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "feed-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
