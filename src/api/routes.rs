//! Router, shared state, and server lifecycle.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audit::AuditLog;
use crate::config::Config;
use crate::host::HostExecutor;
use crate::hub::RoomHub;
use crate::mux::MuxAdapter;
use crate::orchestrator::Orchestrator;
use crate::permission::PermissionBroker;
use crate::pump;
use crate::registry::{RegistryEvent, SessionRegistry};
use crate::speech::SpeechBroker;
use crate::tunnel::TunnelManager;

use super::types::HealthResponse;
use super::{control, sessions, terminal, ws};

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub exec: Arc<HostExecutor>,
    pub mux: Arc<MuxAdapter>,
    pub registry: Arc<SessionRegistry>,
    pub orchestrator: Orchestrator,
    pub speech: SpeechBroker,
    pub hub: Arc<RoomHub>,
    pub permissions: PermissionBroker,
    pub tunnels: TunnelManager,
    pub audit: Arc<AuditLog>,
    pub shutdown: CancellationToken,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // Audio uploads (voice samples, transcription) can be large.
    let upload_routes = Router::new()
        .route("/transcribe", post(control::transcribe))
        .route("/api/voices/upload", post(control::upload_voice))
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024));

    Router::new()
        .route("/api/health", get(health))
        // Listings; `rooms` and `sessions` are synonyms across the surface.
        .route("/api/sessions", get(sessions::list))
        .route("/api/rooms", get(sessions::list))
        .route("/api/machines", get(control::machines))
        .route("/api/voices", get(control::voices))
        .route("/api/tunnels", get(control::tunnels))
        // Lifecycle
        .route("/api/create", post(sessions::create))
        .route("/api/sessions/*name", delete(sessions::destroy))
        .route("/api/rooms/*name", delete(sessions::destroy))
        .route("/api/session/:name/recreate", post(sessions::recreate))
        .route("/api/room/:name/recreate", post(sessions::recreate))
        .route("/api/session/:name/fork", post(sessions::fork))
        .route("/api/room/:name/fork", post(sessions::fork))
        .route("/api/session/:name/spawn-sibling", post(sessions::spawn_sibling))
        .route("/api/room/:name/spawn-sibling", post(sessions::spawn_sibling))
        .route(
            "/api/session/:name/restart-service",
            post(sessions::restart_service),
        )
        .route(
            "/api/room/:name/restart-service",
            post(sessions::restart_service),
        )
        .route("/api/session/:name/config", post(sessions::update_config))
        .route("/api/room/:name/config", post(sessions::update_config))
        .route("/api/check-path", get(sessions::check_path))
        .route("/api/check-branches", get(sessions::check_branches))
        // Room control
        .route("/send/*name", post(control::send))
        .route("/api/say/*name", post(control::say))
        .route("/api/answer/*name", post(control::answer))
        .route("/api/permission/:name", post(control::permission_hook))
        .route(
            "/api/permission/:name/respond",
            post(control::permission_respond),
        )
        // Sockets
        .route("/ws/dashboard", get(ws::dashboard_ws))
        .route("/ws/terminal/*name", get(terminal::terminal_ws))
        .route("/ws/*name", get(ws::room_ws))
        .merge(upload_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build all components, start the background loops, and serve until a
/// shutdown signal arrives.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    tokio::fs::create_dir_all(&config.state_dir).await?;
    tokio::fs::create_dir_all(config.uploads_dir()).await?;

    let exec = Arc::new(HostExecutor::new(Arc::clone(&config)));
    let mux = Arc::new(MuxAdapter::new(Arc::clone(&exec), &config));
    let registry = Arc::new(SessionRegistry::new(Arc::clone(&config), Arc::clone(&mux)).await);
    let hub = RoomHub::new(Arc::clone(&config), Arc::clone(&registry), Arc::clone(&exec));
    let audit = Arc::new(AuditLog::new(config.audit_file()));
    let orchestrator = Orchestrator::new(
        Arc::clone(&config),
        Arc::clone(&exec),
        Arc::clone(&mux),
        Arc::clone(&registry),
        Arc::clone(&audit),
    );
    let speech = SpeechBroker::new(&config, Arc::clone(&exec));
    let permissions = PermissionBroker::new(config.timeouts.permission());
    let tunnels = TunnelManager::new(Arc::clone(&config));
    let shutdown = CancellationToken::new();

    let started = tunnels.up().await;
    if started > 0 {
        tracing::info!("established {} service forward(s)", started);
    }

    // Adopt whatever the multiplexers already run.
    for host in registry.known_hosts() {
        if let Err(e) = registry.reconcile(&host, true).await {
            tracing::warn!("initial reconcile of {} failed: {}", host, e);
        }
    }

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        exec,
        mux: Arc::clone(&mux),
        registry: Arc::clone(&registry),
        orchestrator,
        speech,
        hub: Arc::clone(&hub),
        permissions,
        tunnels,
        audit,
        shutdown: shutdown.clone(),
    });

    for room in registry.list().await {
        pump::start(
            room.id.clone(),
            Arc::clone(&hub),
            Arc::clone(&registry),
            Arc::clone(&mux),
            Arc::clone(&config),
        )
        .await;
    }

    let mut background = Vec::new();
    background.push(tokio::spawn(
        Arc::clone(&registry).run_reconcile_loop(shutdown.child_token()),
    ));
    background.push(tokio::spawn(
        Arc::clone(&hub).run_activity_loop(shutdown.child_token()),
    ));
    background.push(tokio::spawn(run_registry_listener(
        Arc::clone(&state),
        shutdown.child_token(),
    )));

    let app = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!("portal listening on {}", config.bind);

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    // Drain: close sockets, stop pumps, tear down tunnels.
    state.hub.shutdown_all().await;
    state.tunnels.down().await;
    let drain = async {
        for handle in background {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(10), drain)
        .await
        .is_err()
    {
        tracing::warn!("background tasks did not drain within 10s");
    }
    tracing::info!("portal stopped");
    Ok(())
}

/// React to registry lifecycle events: start pumps for new rooms, tear down
/// hub and permission state for vanished ones.
async fn run_registry_listener(state: Arc<AppState>, token: CancellationToken) {
    let mut events = state.registry.subscribe();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("registry event stream lagged by {}", n);
                    continue;
                }
                Err(_) => break,
            },
        };
        match event {
            RegistryEvent::RoomAdded(id) => {
                if let Some(room) = state.registry.get(&id).await {
                    pump::start(
                        room.id,
                        Arc::clone(&state.hub),
                        Arc::clone(&state.registry),
                        Arc::clone(&state.mux),
                        Arc::clone(&state.config),
                    )
                    .await;
                }
            }
            RegistryEvent::RoomGone(id) => {
                state.permissions.cancel_room(&id).await;
                state.hub.remove(&id).await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Health check endpoint.
async fn health(State(_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
