//! Process entrypoint: reads [`Config`] from the environment, connects C1,
//! runs the crash-recovery sweep, optionally loads template files from
//! `TEMPLATES_DIR`, and binds the public HTTP API.
//!
//! `env_logger::init()` at the top wires process-wide logging for the
//! whole binary.

use squadron::agent_runtime;
use squadron::bus::MessageBus;
use squadron::conversation::ConversationMachine;
use squadron::event::LoggingEventHandler;
use squadron::generator::EchoGeneratorFactory;
use squadron::http::{self, AppState};
use squadron::repo::Repo;
use squadron::sse::SseBroker;
use squadron::store::EventStore;
use squadron::template::TemplateService;
use squadron::Config;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from_env();
    log::info!("starting squadron with database_url={}", config.database_url);

    let store = EventStore::connect(&config.database_url).await?;
    let repo = Repo::new(store.pool().clone());
    let events: Arc<dyn squadron::event::EventHandler> = Arc::new(LoggingEventHandler);

    let templates = Arc::new(TemplateService::new(store.pool().clone()));
    if let Ok(dir) = std::env::var("TEMPLATES_DIR") {
        load_templates_from_dir(&templates, &dir).await;
    }

    let bus = Arc::new(MessageBus::new(
        store.clone(),
        config.bus_queue_capacity,
        config.bus_retry_budget,
        events.clone(),
    ));

    let conversations = ConversationMachine::new(
        store.clone(),
        repo.clone(),
        config.answer_timeout,
        config.ack_timeout,
        events.clone(),
        bus.clone(),
    );
    // Crash recovery: conversations left `waiting` past their deadline are
    // transitioned as if the timer had fired.
    conversations.recover().await?;

    let sse = SseBroker::new(
        store.clone(),
        repo.clone(),
        config.sse_heartbeat,
        config.sse_client_buffer,
        events.clone(),
    );

    let generators: Arc<dyn squadron::generator::GeneratorFactory> = Arc::new(EchoGeneratorFactory);

    // Bring every pre-existing active squad's agents back online before
    // accepting traffic, so a restart doesn't silently strand live agents.
    for squad in repo.list_active_squads().await? {
        if let Err(e) = agent_runtime::spawn_squad(
            squad.id,
            &repo,
            &store,
            &bus,
            &conversations,
            &generators,
            None,
            config.agent_step_budget,
            config.agent_history_window,
            &events,
        )
        .await
        {
            log::warn!("failed to spawn agent runtimes for squad {}: {e}", squad.id);
        }
    }

    let state = AppState {
        store,
        repo,
        conversations,
        bus,
        templates,
        sse,
        generators,
        tool_invoker: None,
        agent_step_budget: config.agent_step_budget,
        agent_history_window: config.agent_history_window,
        events,
    };

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    log::info!("listening on {}", config.http_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Scans `dir` non-recursively for `.yaml`/`.yml` files and registers each
/// as a template, so an operator can ship a squad template catalog as
/// plain files rather than posting each one to `/templates`.
async fn load_templates_from_dir(templates: &TemplateService, dir: &str) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("TEMPLATES_DIR={dir} unreadable: {e}");
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match TemplateService::parse_yaml(&raw) {
                Ok(template) => match templates.save_template(&template).await {
                    Ok(()) => log::info!("loaded template '{}' from {}", template.slug, path.display()),
                    Err(e) => log::warn!("failed to save template from {}: {e}", path.display()),
                },
                Err(e) => log::warn!("failed to parse template {}: {e}", path.display()),
            },
            Err(e) => log::warn!("failed to read template file {}: {e}", path.display()),
        }
    }
}
