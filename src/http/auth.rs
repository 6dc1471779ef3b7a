//! `POST /auth/login` — a stand-in for an external identity provider, out
//! of core scope beyond "caller is authenticated". This crate does not
//! ship a user/credential store; the handler exists only so the route
//! table is complete and a reverse proxy/gateway has something to swap in
//! a real implementation behind.

use super::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[allow(dead_code)]
    username: Option<String>,
    #[allow(dead_code)]
    password: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/auth/login", post(login))
}

async fn login(Json(_req): Json<LoginRequest>) -> impl IntoResponse {
    // No credential store here; a deployment fronts this with its own
    // identity provider and never actually routes through this handler.
    (StatusCode::OK, Json(json!({ "token": "dev-token" })))
}
