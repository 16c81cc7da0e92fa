//! Marshal HTTP Server Binary
//!
//! This is the main entry point for the follow-up marshal REST API server.
//! It loads the telescope configuration, sets up the HTTP router, and starts
//! serving requests.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin too-server --features "local-repo,http-server"
//! ```
//!
//! # Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 8080)
//! - `RUST_LOG`: Log level (default: info)
//!
//! Configuration is read from `marshal.toml` when present (current
//! directory, `config/`, or the parent directory), otherwise the built-in
//! telescope roster is used. Field grids are read at startup from
//! `{data_dir}/tessellations/{telescope}.tess` files when present.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use too_marshal::config::AppConfig;
use too_marshal::db::LocalRepository;
use too_marshal::http::{create_router, AppState};
use too_marshal::services::load_tessellations;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(
            env::var("RUST_LOG")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Level::INFO),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting marshal HTTP server");

    let config = AppConfig::from_default_location()?;
    info!(
        telescopes = config.telescopes.len(),
        galaxies = config.galaxies.len(),
        "Configuration loaded"
    );

    let repository = Arc::new(LocalRepository::new());

    let fields = load_tessellations(repository.as_ref(), &config).await?;
    info!(fields, "Telescope tessellations loaded");

    // Create application state
    let state = AppState::new(repository, config);

    // Create router with all endpoints
    let app = create_router(state);

    // Determine bind address
    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    info!("Server listening on http://{}", addr);
    info!("API documentation: http://{}/health", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
