//! Read-only JSON surface over the dispatch plane's own state (sessions,
//! board queue, budget, audit log) plus a server-sent-events broker for
//! live updates. This is a thin observability leaf, not a UI: no templates,
//! no static asset bundling, just axum handlers over [`Db`]/[`BudgetGate`].

pub mod api;
pub mod sse;

use crate::channels::ChannelAdapter;
use crate::config::Config;
use crate::setup::DaemonContext;
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Server-sent event payload pushed to any connected dashboard client.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum SseEvent {
    #[serde(rename = "task_dispatched")]
    TaskDispatched { task_id: String, agent: String, source: String },
    #[serde(rename = "task_complete")]
    TaskComplete { task_id: String, status: String, cost_usd: f64 },
    #[serde(rename = "queue_update")]
    QueueUpdate { pending: usize },
}

/// Shared application state for all web handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<DaemonContext>,
    pub config: Arc<Config>,
    pub adapters: Arc<HashMap<String, Arc<dyn ChannelAdapter>>>,
    pub event_tx: broadcast::Sender<SseEvent>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", api::routes())
        .route("/api/events", axum::routing::get(sse::events_handler))
        .with_state(state)
}

/// Start the web server if enabled in config. Returns immediately once the
/// listener is bound; the server itself runs until `cancel` fires.
pub async fn start_server(state: AppState, cancel: tokio_util::sync::CancellationToken) -> Result<(), anyhow::Error> {
    let bind = state.config.web.bind.clone();
    let port = state.config.web.port;
    let addr = format!("{bind}:{port}");

    let app = build_router(state).layer(
        tower_http::cors::CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "web dashboard listening");
    axum::serve(listener, app).with_graceful_shutdown(async move { cancel.cancelled().await }).await?;

    Ok(())
}
