use clap::Parser;
use concierge_core::ConciergeConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use concierge_server::{http, server, ServerState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "concierge.toml")]
    config: String,

    /// Check configuration and collaborator reachability, then exit.
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match ConciergeConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG, when set, replaces the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let state = match ServerState::build(config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to initialise server state: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        println!("Configuration valid");
        println!("Durable tier: {}", state.store.durable_status().await);
        println!("Timezone: {}", state.config.service.tz());
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    if state.config.http.enabled {
        let http_state = state.clone();
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = http::start_http_server(http_state, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = state.config.service.resolved_socket_path();
    server::run_unix_server(&socket_path, state.clone(), tx.subscribe()).await?;

    Ok(())
}
