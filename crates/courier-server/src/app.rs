use std::path::Path;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use courier_db::Store;
use courier_gateway::broker::BrokerBridge;
use courier_gateway::connection::{self, SessionContext};

/// Identity used when the handshake names nobody.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Clone)]
pub struct ServerState {
    sessions: SessionContext,
}

impl ServerState {
    pub fn new(store: Arc<dyn Store>, bridge: Arc<BrokerBridge>) -> Self {
        Self {
            sessions: SessionContext { store, bridge },
        }
    }

    pub fn bridge(&self) -> &Arc<BrokerBridge> {
        &self.sessions.bridge
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    username: Option<String>,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    broker: &'static str,
    connections: usize,
}

pub fn router(state: ServerState, static_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state);

    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let username = params
        .username
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| ANONYMOUS.to_string());

    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.sessions, username))
}

async fn health(State(state): State<ServerState>) -> Json<Health> {
    let bridge = state.bridge();
    let broker = if bridge.is_connected().await {
        "connected"
    } else {
        "degraded"
    };

    Json(Health {
        status: "ok",
        broker,
        connections: bridge.dispatcher().registry().len(),
    })
}
