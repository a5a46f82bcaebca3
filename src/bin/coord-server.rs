// Coordination server entry point.
//
// Initializes tracing, loads configuration, wires an in-memory Storage,
// a local SessionManager, and a UDP ExchangeManager into a
// CoordinationManager, then serves the façade over a plain TCP
// request/response socket (see `rusty_coord::server`).

use clap::Parser;
use rusty_coord::server::CoordinationServer;
use rusty_coord::storage::InMemoryStorage;
use rusty_coord::{CoordinationConfig, CoordinationManager, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "coord-server", about = "Distributed coordination service")]
struct Args {
    /// Path to a TOML configuration file. Missing files fall back to
    /// built-in defaults, overridable by COORD_* environment variables.
    #[arg(long, default_value = "coord.toml")]
    config: PathBuf,

    /// TCP address the façade request/response socket listens on.
    /// Independent of `bind_address` in the config file, which is the
    /// gossip (UDP) endpoint.
    #[arg(long, default_value = "127.0.0.1:7701")]
    listen: std::net::SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = CoordinationConfig::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .with_target(false)
        .init();

    print_banner();
    info!(config_file = %args.config.display(), "loaded configuration");
    info!(
        bind_address = %config.bind_address,
        session_ttl_secs = config.session_ttl_secs,
        min_backoff_millis = config.min_backoff_millis,
        max_backoff_millis = config.max_backoff_millis,
        cache_capacity = config.cache_capacity,
        io_retry_budget = config.io_retry_budget,
        multiplex_prefix = %config.multiplex_prefix,
        "coordination configuration",
    );

    let storage = Arc::new(InMemoryStorage::new());
    let manager = CoordinationManager::bind(&config, storage).await?;
    manager.spawn_background_tasks();
    info!(session = %manager.get_session(), "coordination manager ready");

    let server = CoordinationServer::new(manager);
    info!(listen = %args.listen, "starting façade request server");
    server.serve(args.listen).await
}

fn print_banner() {
    println!("┌─────────────────────────────────────────────┐");
    println!("│ rusty-coord  — distributed lock coordinator  │");
    println!("└─────────────────────────────────────────────┘");
}
