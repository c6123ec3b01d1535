use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct HealthState {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub supervisor: Arc<Supervisor>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    data_dir: String,
    db_path: String,
    in_flight: usize,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .with_state(state)
}

/// Serves the liveness endpoint until `shutdown` fires.
pub async fn serve(addr: SocketAddr, state: HealthState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    tracing::info!("health endpoint listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("health server failed")?;
    Ok(())
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: "vidrelay-bot",
        data_dir: state.data_dir.display().to_string(),
        db_path: state.db_path.display().to_string(),
        in_flight: state.supervisor.in_flight(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_items_in_flight() {
        let supervisor = Arc::new(Supervisor::new());
        supervisor.register("1-42");
        let state = HealthState {
            data_dir: PathBuf::from("data"),
            db_path: PathBuf::from("data/vidrelay.sqlite3"),
            supervisor,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(state)).await.unwrap() });

        for path in ["/", "/health"] {
            let body: serde_json::Value = reqwest::get(format!("http://{addr}{path}"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(body["ok"], true);
            assert_eq!(body["service"], "vidrelay-bot");
            assert_eq!(body["in_flight"], 1);
        }
    }
}
