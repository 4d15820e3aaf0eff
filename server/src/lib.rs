//! Process glue: one listener serving the realtime gateway and the JSON
//! account api, wired to a shared store, auth service and matchmaking lobby.

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info};

use arena::lobby::Lobby;
use arena::orchestrator::Orchestrator;
use common_match::config::Settings;
use common_match::shutdown::{self, ShutdownReceiver};
use common_match::BoxError;
use services::api::{self, ApiState};
use services::auth::AuthService;
use services::daily::DailyChallenge;
use services::postgres::PgStore;
use services::storage::{MatchStore, StoreHandle};

pub const REVOCATION_FILE: &str = "revoked-tokens.json";

pub async fn run_with_ctrl_c(settings: Settings) -> Result<(), BoxError> {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let ctrl_c = tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "server: ctrl_c listener failed");
        }
        shutdown::trigger(&shutdown_tx);
    });

    let result = run_with_shutdown(settings, shutdown_rx).await;

    ctrl_c.abort();
    result
}

pub async fn run_with_shutdown(
    settings: Settings,
    shutdown_rx: ShutdownReceiver,
) -> Result<(), BoxError> {
    let store = match &settings.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            StoreHandle::new(Arc::new(store) as Arc<dyn MatchStore>)
        }
        None => {
            info!("DATABASE_URL not set, storage-dependent routes answer 503");
            StoreHandle::unavailable()
        }
    };

    let auth = Arc::new(AuthService::new(
        &settings.auth_secret,
        Some(PathBuf::from(REVOCATION_FILE)),
    ));
    let daily = Arc::new(DailyChallenge::new(settings.daily_reset_timezone));

    let orchestrator = Orchestrator::new(store.clone());
    let lobby = Lobby::new(store.clone(), Arc::clone(&orchestrator));
    tokio::spawn(Arc::clone(&lobby).run(shutdown_rx.clone()));

    let realtime = gateway::build_router(gateway::SessionContext {
        auth: Arc::clone(&auth),
        lobby,
        orchestrator,
    });
    let api = api::router(ApiState {
        store,
        auth,
        daily,
        email_hash_key: settings.email_hash_key().to_string(),
    });

    let mut app = realtime.merge(api);
    if !settings.cors_origins.is_empty() {
        let origins = settings.cors_origins.clone();
        let allow = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin.to_str().map(|o| origins.allows(o)).unwrap_or(false)
        });
        app = app.layer(CorsLayer::new().allow_origin(allow));
    }

    let bind = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind, "server listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            error!(%err, "server stopped unexpectedly");
        }
    });

    shutdown::wait(shutdown_rx).await;
    server.abort();
    info!("server stopped");
    Ok(())
}
