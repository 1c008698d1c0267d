//! Read-only JSON inspection endpoint.
//!
//! Serves a single GET route on loopback. The handler never touches the
//! model: it asks the broker loop for a snapshot over a oneshot channel, so
//! state access stays serialised on the loop. A loop that has gone away
//! turns into a 503 rather than a crash.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::broker::LoopEvent;

/// Bind the inspection server on `127.0.0.1:port` and serve forever.
pub async fn serve(port: u16, events: mpsc::UnboundedSender<LoopEvent>) -> Result<()> {
    let app = Router::new().route("/", get(state_handler)).with_state(events);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding inspection endpoint on 127.0.0.1:{port}"))?;
    log::info!("inspection endpoint on 127.0.0.1:{port}");
    axum::serve(listener, app).await.context("inspection server")
}

/// Spawn [`serve`] as a background task.
pub fn spawn(port: u16, events: mpsc::UnboundedSender<LoopEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = serve(port, events).await {
            log::error!("inspection endpoint failed: {e:#}");
        }
    })
}

async fn state_handler(State(events): State<mpsc::UnboundedSender<LoopEvent>>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    if events.send(LoopEvent::Snapshot(tx)).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "broker loop is gone\n".to_string()).into_response();
    }
    match rx.await {
        Ok(snapshot) => {
            let body = serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".into()) + "\n";
            ([(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        Err(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "broker loop is gone\n".to_string()).into_response()
        }
    }
}
