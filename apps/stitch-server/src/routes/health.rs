//! Health check endpoints

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::config::StorageBackend;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub storage: StorageBackend,
    /// Identities with live coordination state
    pub sessions: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: "stitch-server",
        storage: state.config().storage.backend,
        sessions: state.uploads().registry().len(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum_test::TestServer;

    #[tokio::test]
    async fn test_health_reports_backend() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        let server = TestServer::new(router().with_state(AppState::new(config))).unwrap();

        let response = server.get("/health").await;
        response.assert_status_ok();

        let body = response.json::<serde_json::Value>();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["storage"], "memory");
        assert_eq!(body["sessions"], 0);
    }
}
