//! `POST /squads`, `GET /squads/{id}`.

use super::AppState;
use crate::error::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/squads", post(create_squad))
        .route("/squads/{id}", get(get_squad).delete(delete_squad))
}

#[derive(Debug, Deserialize)]
struct CreateSquadRequest {
    #[serde(rename = "ownerId")]
    owner_id: Uuid,
    name: String,
    description: Option<String>,
}

async fn create_squad(
    State(state): State<AppState>,
    Json(req): Json<CreateSquadRequest>,
) -> Result<impl IntoResponse> {
    let squad = state
        .repo
        .create_squad(req.owner_id, &req.name, req.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(squad)))
}

#[derive(Debug, Serialize)]
struct SquadRoster {
    #[serde(flatten)]
    squad: crate::model::Squad,
    agents: Vec<crate::model::Agent>,
}

async fn get_squad(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    let squad = state.repo.get_squad(id).await?;
    let agents = state.repo.list_agents(id).await?;
    Ok(Json(SquadRoster { squad, agents }))
}

async fn delete_squad(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    state.repo.deactivate_squad(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
