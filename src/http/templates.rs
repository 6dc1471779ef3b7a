//! `POST /templates`, `POST /templates/{slug}/apply`.
//!
//! `apply` has nothing to apply without registration — templates have to
//! land somewhere before a slug can be applied. Accepts the raw body text
//! and parses it with [`TemplateService::parse_yaml`]; the template file
//! format is YAML-like and parser-agnostic, and `serde_yaml` happily parses
//! the JSON a non-YAML client would send too.

use super::AppState;
use crate::error::Result;
use crate::model::TemplateCustomization;
use crate::template::TemplateService;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/templates", post(register_template))
        .route("/templates/{slug}", get(get_template))
        .route("/templates/{slug}/apply", post(apply_template))
}

async fn register_template(State(state): State<AppState>, body: String) -> Result<impl IntoResponse> {
    let template = TemplateService::parse_yaml(&body)?;
    state.templates.save_template(&template).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn get_template(State(state): State<AppState>, Path(slug): Path<String>) -> Result<impl IntoResponse> {
    let template = state.templates.get_template(&slug).await?;
    Ok(Json(template))
}

#[derive(Debug, Deserialize)]
struct ApplyTemplateRequest {
    #[serde(rename = "ownerId")]
    owner_id: Uuid,
    #[serde(rename = "squadName")]
    squad_name: String,
    #[serde(default)]
    customization: Option<TemplateCustomization>,
}

async fn apply_template(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<ApplyTemplateRequest>,
) -> Result<impl IntoResponse> {
    let squad = state
        .templates
        .apply_template(&slug, req.owner_id, &req.squad_name, req.customization.as_ref())
        .await?;

    // Bring the newly instantiated squad's agents live immediately, the
    // same spawn `bin/server.rs` runs at startup for pre-existing squads.
    if let Err(e) = crate::agent_runtime::spawn_squad(
        squad.id,
        &state.repo,
        &state.store,
        &state.bus,
        &state.conversations,
        &state.generators,
        state.tool_invoker.as_ref(),
        state.agent_step_budget,
        state.agent_history_window,
        &state.events,
    )
    .await
    {
        log::warn!("failed to spawn agent runtimes for squad {}: {e}", squad.id);
    }

    Ok((StatusCode::CREATED, Json(squad)))
}
