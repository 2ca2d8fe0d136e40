//! Storage Orchestrator
//!
//! Brokers block and file volumes between a container platform and storage
//! backends. This binary wires the engine to a store, bootstraps it and
//! serves the REST API until interrupted.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_orchestrator::domain::ports::StoreClient;
use storage_orchestrator::store::{CrdStore, MemoryStore};
use storage_orchestrator::{
    ApiServer, ApiServerConfig, BackendFactory, Error, FakeArrays, FrontendContext, Orchestrator,
    OrchestratorConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// Process-local, lost on exit
    Memory,
    /// One Kubernetes custom resource per record
    Crd,
}

/// Storage Orchestrator - transaction-logged volume broker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML config file
    #[arg(long, env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Persistent store
    #[arg(long, env = "STORE", value_enum, default_value = "memory")]
    store: StoreKind,

    /// Namespace holding the store records
    #[arg(long, env = "NAMESPACE", default_value = "storage-orchestrator")]
    namespace: String,

    /// Front end driving the orchestrator (csi, docker)
    #[arg(long, env = "FRONTEND")]
    frontend: Option<FrontendContext>,

    /// Seconds to wait after the first publish before enforcing publications
    #[arg(long, env = "PUBLICATION_SYNC_GRACE_SECS")]
    publication_sync_grace_secs: Option<u64>,

    /// Upper bound on requested volume sizes
    #[arg(long, env = "MAX_VOLUME_SIZE_BYTES")]
    max_volume_size_bytes: Option<u64>,

    /// Do not start the monitor that abandons stale volume creates
    #[arg(long, env = "DISABLE_TRANSACTION_MONITOR")]
    disable_transaction_monitor: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!(
        version = storage_orchestrator::VERSION,
        api_addr = %args.api_addr,
        store = ?args.store,
        "Starting storage orchestrator"
    );

    let config = load_config(&args)?;
    let store: Arc<dyn StoreClient> = match args.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Crd => Arc::new(CrdStore::try_default(args.namespace.clone()).await?),
    };

    // Only the in-process driver ships with this binary
    let factory = BackendFactory::with_fake(FakeArrays::new());
    info!(drivers = ?factory.driver_names(), "Storage drivers registered");

    let orchestrator = Orchestrator::new(config, store, factory);

    // A failed bootstrap leaves the API up so /ready can report why
    match orchestrator.bootstrap(!args.disable_transaction_monitor).await {
        Ok(()) => {
            let applied = orchestrator.apply_configured_resources().await;
            if applied > 0 {
                info!(applied, "Applied configured backends and storage classes");
            }
        }
        Err(e) => error!(error = %e, "Bootstrap failed, API calls will report not ready"),
    }

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse::<SocketAddr>()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
        ..Default::default()
    };
    let server = ApiServer::new(api_config, orchestrator.clone());

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received"),
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
        let _ = shutdown.send(());
    });

    let served = server.run().await;
    orchestrator.shutdown().await;
    info!("Orchestrator shutdown complete");
    served
}

fn load_config(args: &Args) -> Result<OrchestratorConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading config file");
            OrchestratorConfig::from_file(path)?
        }
        None => OrchestratorConfig::default(),
    };

    if let Some(frontend) = args.frontend {
        config.frontend = frontend;
    }
    if let Some(grace) = args.publication_sync_grace_secs {
        config.publication_sync_grace_secs = grace;
    }
    if let Some(max) = args.max_volume_size_bytes {
        config.max_volume_size_bytes = Some(max);
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
