//! route-cache server.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http server ──▶ pipeline ──▶ global middleware
//!                     (request id,      │           routed middleware
//!                      trace, timeout)  │           rule policies (headers,
//!                                       │             redirect, proxy, cache)
//!                                       ▼
//!                                    handler ◀──▶ cache engine ◀──▶ storage
//!
//!     config file ──▶ watcher ──▶ reloader ──▶ pipeline.update
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use route_cache::config::{load_config, AppConfig, ConfigWatcher};
use route_cache::http::server::spawn_reloader;
use route_cache::observability::{logging, metrics};
use route_cache::{HandlerCatalog, HttpServer, Pipeline, Shutdown};

#[derive(Parser)]
#[command(name = "route-cache")]
#[command(about = "Route-rule driven HTTP server with response caching", long_about = None)]
struct Args {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload the configuration file when it changes
    #[arg(short, long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let catalog = Arc::new(HandlerCatalog::with_builtins());

    let config = match &args.config {
        Some(path) => load_config(path, &catalog)?,
        None => AppConfig::default(),
    };

    logging::init(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "route-cache starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        handlers = config.handlers.len(),
        route_rules = config.route_rules.len(),
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let pipeline = Arc::new(Pipeline::from_config(&config, &catalog)?);

    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();

    // Kept alive for the lifetime of the server.
    let _watcher = match (&args.config, args.watch) {
        (Some(path), true) => {
            let (watcher, updates) = ConfigWatcher::new(path, catalog.clone());
            spawn_reloader(pipeline.clone(), catalog.clone(), updates);
            Some(watcher.run()?)
        }
        (None, true) => {
            tracing::warn!("--watch ignored without --config");
            None
        }
        _ => None,
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    HttpServer::new(&config, pipeline).run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
