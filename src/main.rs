use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pogo::config::DispatcherConfig;
use pogo::dispatcher::Dispatcher;
use pogo::error::PogoError;
use pogo::shutdown::install_shutdown_handler;
use pogo::store::MemoryStore;
use pogo::{api, Result};

const EXIT_CONFIG_ERROR: i32 = 64;
const EXIT_STORE_UNREACHABLE: i32 = 69;
const EXIT_INTERNAL: i32 = 70;

#[derive(Parser, Debug)]
#[command(name = "pogo-dispatcher")]
#[command(about = "Fleet command-execution dispatcher")]
struct Args {
    /// Configuration file (YAML). POGO_CONFIG overrides.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stay attached to the terminal.
    #[arg(long)]
    foreground: bool,

    /// Log level filter. POGO_LOG_LEVEL overrides.
    #[arg(long)]
    log_level: Option<String>,

    /// API bind address, overriding the configured one.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

fn load_config(args: &Args) -> Result<DispatcherConfig> {
    let path = std::env::var("POGO_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(|| args.config.clone());
    let mut config = match path {
        Some(path) => DispatcherConfig::load(&path)?,
        None => DispatcherConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = std::env::var("POGO_LOG_LEVEL")
        .ok()
        .or_else(|| args.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Configuration error");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    if !args.foreground {
        tracing::info!("Daemonization is delegated to the service manager; running attached");
    }

    tracing::info!(
        dispatcher_id = %config.dispatcher_id,
        bind = %config.bind,
        workers = config.workers.len(),
        "Starting pogo dispatcher"
    );

    let shutdown = install_shutdown_handler();

    // The coordination-store seam: the in-process store backs a single-node
    // deployment; a networked backend plugs in behind the same trait.
    let store = MemoryStore::new();
    let session = Arc::new(store.session());

    let dispatcher = match Dispatcher::start(config.clone(), session, shutdown.clone()).await {
        Ok(dispatcher) => dispatcher,
        Err(PogoError::CoordinationStoreUnavailable(msg)) => {
            tracing::error!(error = %msg, "Coordination store unreachable at startup");
            std::process::exit(EXIT_STORE_UNREACHABLE);
        }
        Err(e) => {
            tracing::error!(error = %e, "Dispatcher startup failed");
            std::process::exit(EXIT_INTERNAL);
        }
    };

    if let Err(e) = api::serve(config.bind, dispatcher, shutdown.clone()).await {
        tracing::error!(error = %e, "API server failed");
        std::process::exit(EXIT_INTERNAL);
    }

    tracing::info!("Shutdown complete");
}
