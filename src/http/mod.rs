//! C8 — the public HTTP API.
//!
//! A thin transport layer over C1/C2/C4/C6/C7: every handler below is a
//! short adapter that extracts a payload, calls straight into one of those
//! components, and maps the result to a status code. It holds no business
//! state of its own — [`AppState`] is just shared handles to the
//! components it fronts.
//!
//! Route shape (one `routes()` function per resource, `Router<AppState>`)
//! and the `impl IntoResponse` error bridge are generalized from the
//! teacher's `mcp_http_adapter.rs` axum adapter, with the per-resource
//! `routes()` module layout the pack's `RustyGPT` server uses
//! (`handlers::threads::routes() -> Router<Arc<AppState>>`).

mod auth;
mod conversations;
mod sse;
mod squads;
mod templates;

use crate::bus::MessageBus;
use crate::conversation::ConversationMachine;
use crate::error::Error;
use crate::event::EventHandler;
use crate::generator::GeneratorFactory;
use crate::repo::Repo;
use crate::sse::SseBroker;
use crate::store::EventStore;
use crate::template::TemplateService;
use crate::tool::ToolInvoker;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared handles every handler is given through axum's `State` extractor.
/// Cloning is cheap — every field is itself an `Arc`/pool handle.
#[derive(Clone)]
pub struct AppState {
    pub store: EventStore,
    pub repo: Repo,
    pub conversations: Arc<ConversationMachine>,
    pub bus: Arc<MessageBus>,
    pub templates: Arc<TemplateService>,
    pub sse: SseBroker,
    /// Resolves a freshly applied template's agents to live
    /// [`crate::agent_runtime::AgentRuntime`]s, mirroring the startup
    /// spawn in `bin/server.rs` so a squad is immediately responsive.
    pub generators: Arc<dyn GeneratorFactory>,
    pub tool_invoker: Option<Arc<dyn ToolInvoker>>,
    pub agent_step_budget: usize,
    pub agent_history_window: usize,
    pub events: Arc<dyn EventHandler>,
}

/// Assembles the full router: auth, squads, templates, conversations, SSE.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(auth::routes())
        .merge(squads::routes())
        .merge(templates::routes())
        .merge(conversations::routes())
        .merge(sse::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Translates a domain [`Error`] to a stable `{error: <code>, message}`
/// body and status code at the HTTP boundary.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::IllegalTransition(_) => StatusCode::CONFLICT,
            Error::NoResponder { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::Backpressure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::Invalid(_) => StatusCode::BAD_REQUEST,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
