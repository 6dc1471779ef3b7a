//! End-to-end HTTP scenarios driven through the real `axum::Router` via
//! `tower::ServiceExt::oneshot`, against an in-memory SQLite-backed
//! [`AppState`]. No network socket is bound; this exercises the same
//! routing/extraction/serialization path `bin/server.rs` serves.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use squadron::bus::MessageBus;
use squadron::conversation::ConversationMachine;
use squadron::event::NoopEventHandler;
use squadron::http::{self, AppState};
use squadron::model::Role;
use squadron::repo::Repo;
use squadron::sse::SseBroker;
use squadron::store::EventStore;
use squadron::template::TemplateService;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

async fn test_state() -> AppState {
    let store = EventStore::connect("sqlite::memory:").await.unwrap();
    let repo = Repo::new(store.pool().clone());
    let events: Arc<dyn squadron::event::EventHandler> = Arc::new(NoopEventHandler);

    let bus = Arc::new(MessageBus::new(store.clone(), 16, 3, events.clone()));
    let conversations = ConversationMachine::new(
        store.clone(),
        repo.clone(),
        Duration::from_millis(150),
        Duration::from_millis(150),
        events.clone(),
        bus.clone(),
    );
    let templates = Arc::new(TemplateService::new(store.pool().clone()));
    let sse = SseBroker::new(store.clone(), repo.clone(), Duration::from_secs(15), 64, events.clone());
    let generators: Arc<dyn squadron::generator::GeneratorFactory> =
        Arc::new(squadron::generator::EchoGeneratorFactory);

    AppState {
        store,
        repo,
        conversations,
        bus,
        templates,
        sse,
        generators,
        tool_invoker: None,
        agent_step_budget: 8,
        agent_history_window: 50,
        events,
    }
}

async fn post(state: &AppState, uri: &str, body: Value) -> (StatusCode, Value) {
    let app = http::router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, parsed)
}

async fn get(state: &AppState, uri: &str) -> (StatusCode, Value) {
    let app = http::router(state.clone());
    let response = app
        .oneshot(Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, parsed)
}

/// Seeds a squad with one backend developer and one tech lead, plus a
/// routing rule sending "implementation" questions from the former to the
/// latter at escalation level 0.
async fn seed_squad(state: &AppState) -> (Uuid, Uuid, Uuid) {
    let squad = state.repo.create_squad(Uuid::new_v4(), "eng", None).await.unwrap();
    let backend = state
        .repo
        .create_agent(squad.id, Role::BackendDeveloper, "default", "gpt", "", vec![])
        .await
        .unwrap();
    let lead = state
        .repo
        .create_agent(squad.id, Role::TechLead, "default", "gpt", "", vec![])
        .await
        .unwrap();
    state
        .repo
        .create_rule(squad.id, Role::BackendDeveloper, "implementation", 0, Role::TechLead, 10)
        .await
        .unwrap();
    (squad.id, backend.id, lead.id)
}

#[tokio::test]
async fn scenario_single_hop_question_answer_ack() {
    let state = test_state().await;
    let (squad_id, backend, lead) = seed_squad(&state).await;

    let (status, conversation) = post(
        &state,
        &format!("/squads/{squad_id}/conversations"),
        json!({
            "askerAgentId": backend,
            "questionType": "implementation",
            "content": "Redis or Memcached?",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(conversation["state"], "waiting");
    assert_eq!(conversation["currentResponderAgentId"], lead.to_string());

    let conversation_id = conversation["id"].as_str().unwrap().to_string();

    let (status, _) = post(
        &state,
        &format!("/conversations/{conversation_id}/messages"),
        json!({ "senderAgentId": lead, "type": "answer", "content": "Use Redis." }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, fetched) = get(&state, &format!("/conversations/{conversation_id}/timeline")).await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = fetched.as_array().unwrap().iter().map(|e| e["kind"].as_str().unwrap()).collect();
    assert!(kinds.contains(&"answered"));

    let (status, _) = post(
        &state,
        &format!("/conversations/{conversation_id}/messages"),
        json!({ "senderAgentId": backend, "type": "acknowledgment", "content": "" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let conversation = state
        .repo
        .get_conversation(Uuid::parse_str(&conversation_id).unwrap())
        .await
        .unwrap();
    assert_eq!(conversation.state, squadron::model::ConversationState::Acknowledged);
    assert!(conversation.closed_at.is_some());
}

#[tokio::test]
async fn scenario_no_responder_rejects_with_422() {
    let state = test_state().await;
    let squad = state.repo.create_squad(Uuid::new_v4(), "eng", None).await.unwrap();
    let backend = state
        .repo
        .create_agent(squad.id, Role::BackendDeveloper, "default", "gpt", "", vec![])
        .await
        .unwrap();
    // no routing rule and no other agents: nothing can resolve a responder.

    let (status, body) = post(
        &state,
        &format!("/squads/{}/conversations", squad.id),
        json!({ "askerAgentId": backend.id, "questionType": "design_review", "content": "how?" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "NoResponder");
}

#[tokio::test]
async fn scenario_broadcast_records_event_with_no_conversation() {
    let state = test_state().await;
    let (squad_id, backend, _lead) = seed_squad(&state).await;

    let (status, body) = post(
        &state,
        &format!("/squads/{squad_id}/messages"),
        json!({ "senderAgentId": backend, "type": "standup", "content": "status: green" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["messageId"].is_string());
}

#[tokio::test]
async fn scenario_escalation_on_answer_timeout_opens_child_conversation() {
    let state = test_state().await;
    let squad = state.repo.create_squad(Uuid::new_v4(), "eng", None).await.unwrap();
    let backend = state
        .repo
        .create_agent(squad.id, Role::BackendDeveloper, "default", "gpt", "", vec![])
        .await
        .unwrap();
    let lead = state
        .repo
        .create_agent(squad.id, Role::TechLead, "default", "gpt", "", vec![])
        .await
        .unwrap();
    let architect = state
        .repo
        .create_agent(squad.id, Role::SolutionArchitect, "default", "gpt", "", vec![])
        .await
        .unwrap();
    state
        .repo
        .create_rule(squad.id, Role::BackendDeveloper, "implementation", 0, Role::TechLead, 10)
        .await
        .unwrap();
    state
        .repo
        .create_rule(squad.id, Role::BackendDeveloper, "implementation", 1, Role::SolutionArchitect, 10)
        .await
        .unwrap();

    let (status, conversation) = post(
        &state,
        &format!("/squads/{}/conversations", squad.id),
        json!({ "askerAgentId": backend.id, "questionType": "implementation", "content": "stuck" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(conversation["currentResponderAgentId"], lead.id.to_string());

    // the answer timeout configured in test_state() is 150ms.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let escalated = state
        .repo
        .get_conversation(Uuid::parse_str(conversation["id"].as_str().unwrap()).unwrap())
        .await
        .unwrap();
    assert_eq!(escalated.state, squadron::model::ConversationState::Escalated);

    let children: Vec<_> = state
        .repo
        .list_waiting_conversations()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.parent_conversation_id == Some(escalated.id))
        .collect();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].current_responder_agent_id, Some(architect.id));
}

#[tokio::test]
async fn scenario_template_apply_is_atomic_on_orphan_responder_role() {
    let state = test_state().await;

    let template = json!({
        "name": "Backend Squad",
        "slug": "backend-squad",
        "version": "1.0.0",
        "agents": [
            {"role": "project_manager"},
            {"role": "backend_developer"},
        ],
        "routingRules": [
            {
                "askerRole": "backend_developer",
                "questionType": "default",
                "escalationLevel": 0,
                "responderRole": "qa_tester",
                "priority": 1,
            }
        ],
    });

    let app = http::router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/templates")
                .header("content-type", "application/json")
                .body(Body::from(template.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, _) = get(&state, "/templates/backend-squad").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scenario_template_apply_creates_a_full_squad() {
    let state = test_state().await;
    let owner = Uuid::new_v4();

    let template = json!({
        "name": "Backend Squad",
        "slug": "backend-squad",
        "version": "1.0.0",
        "agents": [
            {"role": "project_manager"},
            {"role": "backend_developer", "toolCapabilities": ["shell.exec"]},
        ],
        "routingRules": [
            {
                "askerRole": "backend_developer",
                "questionType": "default",
                "escalationLevel": 0,
                "responderRole": "project_manager",
                "priority": 1,
            }
        ],
    });
    let (status, _) = post(&state, "/templates", template).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, squad) = post(
        &state,
        "/templates/backend-squad/apply",
        json!({ "ownerId": owner, "squadName": "My Squad" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let squad_id = Uuid::parse_str(squad["id"].as_str().unwrap()).unwrap();
    let agents = state.repo.list_agents(squad_id).await.unwrap();
    assert_eq!(agents.len(), 2);

    let (status, roster) = get(&state, &format!("/squads/{squad_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(roster["agents"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn squad_delete_is_a_soft_delete() {
    let state = test_state().await;
    let (squad_id, _backend, _lead) = seed_squad(&state).await;

    let app = http::router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/squads/{squad_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let squad = state.repo.get_squad(squad_id).await.unwrap();
    assert!(!squad.active);
    // history is preserved: the agents created under it are still readable.
    assert_eq!(state.repo.list_agents(squad_id).await.unwrap().len(), 2);
}
