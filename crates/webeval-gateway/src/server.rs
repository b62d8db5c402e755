//! Axum-based dashboard server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::connection::handle_ws_connection;
use crate::relay::spawn_relay;
use crate::state::DashboardState;

/// Build the router. `/ws` and `/health` are registered before the UI
/// catch-all so they take priority.
pub fn build_router(state: Arc<DashboardState>, ui_enabled: bool) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    if ui_enabled {
        app = app.merge(webeval_web::ui_router());
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the dashboard until Ctrl-C or until `shutdown` is cancelled.
///
/// When `ui_enabled` is true, the embedded dashboard is served at `/`.
pub async fn start_dashboard(
    state: Arc<DashboardState>,
    port: u16,
    ui_enabled: bool,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let bind_addr = state.config.dashboard_bind();
    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Dashboard listening on {addr}");
    if ui_enabled {
        info!("Dashboard UI available at http://{addr}/");
    }

    let relay_cancel = shutdown.child_token();
    let relay = spawn_relay(state.clone(), relay_cancel.clone());

    let app = build_router(state, ui_enabled);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await;

    relay_cancel.cancel();
    let _ = relay.await;
    served?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<DashboardState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let connections = state.connection_count().await;
    let session = state.sessions.active();

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "connections": connections,
        "session": session.as_ref().map(|s| s.info()),
        "phase": session.as_ref().map(|s| s.control().phase()),
    }))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                warn!(%e, "Failed to install Ctrl-C handler");
                shutdown.cancelled().await;
            }
        },
        _ = shutdown.cancelled() => info!("Dashboard shutting down"),
    }
}
