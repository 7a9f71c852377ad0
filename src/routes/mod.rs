pub mod auth;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::health::HealthStatus;
use crate::server::Server;

pub fn create_routes(server: Server) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .merge(auth::create_auth_routes())
        .with_state(server)
}

async fn health_handler(State(server): State<Server>) -> Response {
    let response = server.health_service.check_health().await;
    let status = match response.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(response)).into_response()
}
