//! `GET /sse/squad/{id}`, `GET /sse/execution/{id}`.

use super::AppState;
use crate::error::Result;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sse/squad/{id}", get(squad_stream))
        .route("/sse/execution/{id}", get(execution_stream))
}

#[derive(Debug, Deserialize)]
struct ResumeQuery {
    #[serde(rename = "lastEventId")]
    last_event_id: Option<i64>,
}

/// Resumes from the `Last-Event-ID` header when the client sent one
/// (standard EventSource reconnect behavior), falling back to the
/// `lastEventId` query parameter for clients that can't set headers.
fn resolve_last_event_id(headers: &HeaderMap, query: &ResumeQuery) -> Option<i64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .or(query.last_event_id)
}

async fn squad_stream(
    State(state): State<AppState>,
    Path(squad_id): Path<Uuid>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
) -> Result<impl axum::response::IntoResponse> {
    // existence check so an unknown squad 404s rather than opening a
    // stream that will never emit anything.
    state.repo.get_squad(squad_id).await?;
    let last_event_id = resolve_last_event_id(&headers, &query);
    Ok(state.sse.squad_stream(squad_id, last_event_id))
}

async fn execution_stream(
    State(state): State<AppState>,
    Path(task_execution_id): Path<Uuid>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
) -> Result<impl axum::response::IntoResponse> {
    let squad_id = state.repo.find_squad_for_execution(task_execution_id).await?;
    let last_event_id = resolve_last_event_id(&headers, &query);
    Ok(state.sse.execution_stream(squad_id, task_execution_id, last_event_id))
}
