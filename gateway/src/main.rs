//! Standalone realtime gateway: matchmaking + match rooms without the HTTP
//! account surface. The full deployment uses the `server` binary instead.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use arena::lobby::Lobby;
use arena::orchestrator::Orchestrator;
use common_match::config::Settings;
use common_match::{shutdown, telemetry};
use services::auth::AuthService;
use services::postgres::PgStore;
use services::storage::{MatchStore, StoreHandle};

#[tokio::main]
async fn main() {
    telemetry::init("gateway");

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!(%err, "gateway: configuration rejected");
            return;
        }
    };

    let store = match &settings.database_url {
        Some(url) => match PgStore::connect(url).await {
            Ok(store) => StoreHandle::new(Arc::new(store) as Arc<dyn MatchStore>),
            Err(err) => {
                error!(%err, "gateway: database connection failed");
                return;
            }
        },
        None => {
            info!("DATABASE_URL not set, storage-dependent paths will be unavailable");
            StoreHandle::unavailable()
        }
    };

    let auth = Arc::new(AuthService::new(
        &settings.auth_secret,
        Some(PathBuf::from("revoked-tokens.json")),
    ));
    let orchestrator = Orchestrator::new(store.clone());
    let lobby = Lobby::new(store, Arc::clone(&orchestrator));

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    tokio::spawn(Arc::clone(&lobby).run(shutdown_rx.clone()));

    let router = gateway::build_router(gateway::SessionContext { auth, lobby, orchestrator });

    let bind = format!("0.0.0.0:{}", settings.port);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, bind, "gateway: could not bind");
            return;
        }
    };
    info!(bind, "gateway listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router.into_make_service()).await {
            error!(%err, "gateway server stopped unexpectedly");
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "gateway: ctrl_c listener failed");
    }
    shutdown::trigger(&shutdown_tx);
    server.abort();
    info!("gateway stopped");
}
