//! CAD console server.
//!
//! Serves the dispatch, unit and supervisor consoles of one role-play server
//! over HTTP. Configuration comes from `CAD_*` environment variables; see
//! [`cad_console::config::Config::from_env`].

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cad_console::api::{AppState, router};
use cad_console::config::Config;
use cad_console::roles::SessionStore;
use cad_console::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("cad_console=info".parse()?))
        .init();

    let config = Config::from_env()?;
    let server_id = config.server.server_id();

    info!(
        port = config.port,
        db_url = %config.database_url,
        server = %server_id,
        "Starting CAD console"
    );

    let storage = Storage::new(&config.database_url, &server_id).await?;
    info!("Database initialized");

    if config.supervisor_key.is_none() {
        warn!("CAD_SUPERVISOR_KEY is not set; supervisor login is disabled");
    }

    let state = AppState {
        storage,
        sessions: SessionStore::new(config.supervisor_key.clone()),
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, server = %server_id, "CAD console is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
