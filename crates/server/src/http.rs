//! HTTP API: health, session snapshot, hook ingress, user actions and the
//! `/ws` update stream.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use panedock_protocol::{ActionOutcome, ClientMessage, ServerMessage};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::dispatcher::Dispatcher;
use crate::hook_listener::HookIngress;
use crate::session_store::SessionStore;
use crate::websocket;
use crate::VERSION;

#[derive(Clone)]
pub struct AppState {
    pub store: SessionStore,
    pub ingress: HookIngress,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/api/hook", post(hook_handler))
        .route("/api/actions", post(actions_handler))
        .route("/ws", get(websocket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "sessions": state.store.snapshot().len(),
    }))
}

async fn sessions_handler(State(state): State<AppState>) -> Json<ServerMessage> {
    Json(ServerMessage::SessionsList {
        sessions: state.store.snapshot().to_list(),
    })
}

/// Same payload as one socket line. 204 once the store has applied it, so a
/// following `GET /api/sessions` sees the change.
async fn hook_handler(State(state): State<AppState>, Json(body): Json<Value>) -> StatusCode {
    if state.ingress.accept_value(&body).await {
        state.store.sink().barrier().await;
        StatusCode::NO_CONTENT
    } else {
        StatusCode::BAD_REQUEST
    }
}

async fn actions_handler(
    State(state): State<AppState>,
    Json(message): Json<ClientMessage>,
) -> Json<ActionOutcome> {
    Json(state.dispatcher.dispatch(message).await)
}
