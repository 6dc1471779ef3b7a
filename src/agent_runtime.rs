//! C5 — the Agent Runtime: one processing loop per live agent.
//!
//! A bounded tool-call iteration loop: parse a response, detect a requested
//! tool call, execute it, feed the result back, repeat until the model stops
//! asking for tools or `max_tool_iterations` is hit. The "parse" step is
//! already done by the [`TextGenerator`] contract (it returns structured
//! [`GeneratorToolCall`]s instead of a raw string to scan), and the
//! iteration cap is a configurable [`Config::agent_step_budget`] rather than
//! a hardcoded constant.

use crate::bus::{Inbound, MessageBus};
use crate::conversation::ConversationMachine;
use crate::error::Result;
use crate::event::{EventHandler, RuntimeEvent};
use crate::generator::{GeneratorFactory, GeneratorRole, HistoryTurn, TextGenerator};
use crate::model::{Message, MessageType, Role};
use crate::repo::Repo;
use crate::store::EventStore;
use crate::tool::{AclToolInvoker, ToolInvoker};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Wires one [`Agent`](crate::model::Agent)'s capabilities to the bus and
/// conversation machine, and drives its inbound queue.
pub struct AgentRuntime {
    agent_id: Uuid,
    squad_id: Uuid,
    role: Role,
    system_prompt: String,
    generator: Arc<dyn TextGenerator>,
    tool_invoker: Option<AclToolInvoker>,
    tool_capabilities: Vec<String>,
    bus: Arc<MessageBus>,
    conversations: Arc<ConversationMachine>,
    store: EventStore,
    step_budget: usize,
    history_window: i64,
    events: Arc<dyn EventHandler>,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: Uuid,
        squad_id: Uuid,
        role: Role,
        system_prompt: String,
        generator: Arc<dyn TextGenerator>,
        tool_invoker: Option<AclToolInvoker>,
        tool_capabilities: Vec<String>,
        bus: Arc<MessageBus>,
        conversations: Arc<ConversationMachine>,
        store: EventStore,
        step_budget: usize,
        history_window: usize,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            agent_id,
            squad_id,
            role,
            system_prompt,
            generator,
            tool_invoker,
            tool_capabilities,
            bus,
            conversations,
            store,
            step_budget,
            history_window: history_window as i64,
            events,
        }
    }

    /// Consumes `inbound` until the bus drops the sending half (agent
    /// unregistered or process shutdown). Runs until cancelled at the
    /// `recv().await` suspension point — every other await inside
    /// `handle_message` is bounded by the step budget and the generator's
    /// own timeout, so a cancellation there is never silent data loss: the
    /// inbound message is only removed from the channel once fully handled.
    pub async fn run(mut self, mut inbound: Inbound) {
        while let Some(message) = inbound.recv().await {
            if let Err(e) = self.handle_message(&message).await {
                log::warn!(
                    "agent {} failed to handle message {}: {e}",
                    self.agent_id,
                    message.id
                );
                self.events
                    .on_event(&RuntimeEvent::GeneratorFailed {
                        agent_id: self.agent_id,
                        conversation_id: message.conversation_id,
                        reason: e.to_string(),
                    })
                    .await;
                self.record_human_intervention(&message, &e.to_string()).await;
            }
        }
    }

    async fn handle_message(&mut self, message: &Message) -> crate::error::Result<()> {
        let history = self.build_history(message).await?;
        let allowed_tools = &self.tool_capabilities;

        let mut turns = history;
        let mut reply = String::new();

        for step in 0..self.step_budget {
            let (text, tool_calls) = self
                .generator
                .generate(&self.system_prompt, &turns, allowed_tools)
                .await
                .map_err(|e| crate::error::Error::UpstreamUnavailable(e.to_string()))?;

            if tool_calls.is_empty() {
                reply = text;
                break;
            }

            turns.push(HistoryTurn {
                role: GeneratorRole::Assistant,
                content: text,
            });

            for call in tool_calls {
                let Some(invoker) = self.tool_invoker.as_ref() else {
                    return Err(crate::error::Error::PermissionDenied(
                        "agent has no tool capabilities configured".to_string(),
                    ));
                };
                let result = invoker.execute(&call.name, call.arguments).await;
                let turn_content = match result {
                    Ok(outcome) => serde_json::to_string(&outcome.output).unwrap_or_default(),
                    Err(e) => format!("error: {e}"),
                };
                turns.push(HistoryTurn {
                    role: GeneratorRole::Tool,
                    content: turn_content,
                });
            }

            if step + 1 == self.step_budget {
                reply = "step budget exhausted before a final answer was produced".to_string();
            }
        }

        self.respond(message, reply).await
    }

    async fn build_history(&self, message: &Message) -> crate::error::Result<Vec<HistoryTurn>> {
        let mut turns = vec![HistoryTurn {
            role: GeneratorRole::System,
            content: self.system_prompt.clone(),
        }];

        if let Some(conversation_id) = message.conversation_id {
            let messages = self
                .store
                .read_conversation_messages(conversation_id, self.history_window)
                .await?;
            if !messages.is_empty() {
                for m in messages {
                    let role = if m.sender_agent_id == self.agent_id {
                        GeneratorRole::Assistant
                    } else {
                        GeneratorRole::User
                    };
                    turns.push(HistoryTurn {
                        role,
                        content: m.content,
                    });
                }
                return Ok(turns);
            }
        }

        turns.push(HistoryTurn {
            role: GeneratorRole::User,
            content: message.content.clone(),
        });
        Ok(turns)
    }

    /// Publishes the generated reply as the agent's single outbound message,
    /// and advances the conversation state machine if the inbound message
    /// was a `question`.
    ///
    /// Only message kinds that actually warrant a reply reach the generator
    /// at all: `question` and `review_request`. Everything else —
    /// `answer`, `acknowledgment`, `completion`, `standup`, and the rest —
    /// is consumed without producing an outbound message. Since `answer()`
    /// delivers straight to the asker's inbound queue and every active
    /// agent runs a loop, auto-replying to those kinds would ping-pong
    /// `completion` messages back and forth forever.
    async fn respond(&self, message: &Message, reply: String) -> crate::error::Result<()> {
        match message.message_type {
            MessageType::Question => {
                if let Some(conversation_id) = message.conversation_id {
                    self.conversations
                        .answer(conversation_id, self.agent_id, &reply)
                        .await
                } else {
                    self.publish_standalone(message, reply).await
                }
            }
            MessageType::ReviewRequest => self.publish_standalone(message, reply).await,
            _ => Ok(()),
        }
    }

    async fn publish_standalone(&self, message: &Message, reply: String) -> crate::error::Result<()> {
        let outbound = Message {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            sender_agent_id: self.agent_id,
            recipient_agent_id: Some(message.sender_agent_id),
            message_type: MessageType::Completion,
            content: reply,
            metadata: HashMap::new(),
            created_at: chrono::Utc::now(),
        };
        self.bus.publish(self.squad_id, outbound).await.map(|_| ())
    }

    async fn record_human_intervention(&self, message: &Message, reason: &str) {
        let outbound = Message {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            sender_agent_id: self.agent_id,
            recipient_agent_id: None,
            message_type: MessageType::HumanInterventionRequired,
            content: format!("agent {} ({}) could not complete this message: {reason}", self.agent_id, self.role),
            metadata: HashMap::new(),
            created_at: chrono::Utc::now(),
        };
        let _ = self.bus.publish(self.squad_id, outbound).await;
    }
}

/// Starts one [`AgentRuntime`] per active agent in `squad_id`, registering
/// each with the bus first so no message published during startup is
/// dropped. `generators` resolves each agent's opaque `generatorRef`;
/// `tool_invoker` is shared across agents and gated per-agent by their own
/// `toolCapabilities` ACL (`None` if an agent declares no capabilities, so
/// it never reaches a tool invoker at all).
///
/// Called once per squad at process startup (for squads that existed
/// before the restart) and once right after `TemplateService::apply_template`
/// commits, so a freshly instantiated squad's agents are live immediately.
pub async fn spawn_squad(
    squad_id: Uuid,
    repo: &Repo,
    store: &EventStore,
    bus: &Arc<MessageBus>,
    conversations: &Arc<ConversationMachine>,
    generators: &Arc<dyn GeneratorFactory>,
    tool_invoker: Option<&Arc<dyn ToolInvoker>>,
    step_budget: usize,
    history_window: usize,
    events: &Arc<dyn EventHandler>,
) -> Result<()> {
    for agent in repo.list_agents(squad_id).await?.into_iter().filter(|a| a.active) {
        let inbound = bus.register_agent(agent.id, squad_id).await?;
        let generator = generators.resolve(&agent.generator_ref);
        let acl = if agent.tool_capabilities.is_empty() {
            None
        } else {
            tool_invoker.map(|inv| AclToolInvoker::new(inv.clone(), agent.tool_capabilities.clone()))
        };

        let runtime = AgentRuntime::new(
            agent.id,
            squad_id,
            agent.role,
            agent.system_prompt.clone(),
            generator,
            acl,
            agent.tool_capabilities.clone(),
            bus.clone(),
            conversations.clone(),
            store.clone(),
            step_budget,
            history_window,
            events.clone(),
        );
        tokio::spawn(runtime.run(inbound));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NoopEventHandler;
    use crate::generator::EchoGenerator;
    use crate::repo::Repo;
    use tokio::time::Duration;

    #[tokio::test]
    async fn answering_a_question_advances_the_conversation_to_answered() {
        let store = EventStore::connect("sqlite::memory:").await.unwrap();
        let repo = Repo::new(store.pool().clone());
        let squad = repo.create_squad(Uuid::new_v4(), "eng", None).await.unwrap();
        let asker = repo
            .create_agent(squad.id, Role::BackendDeveloper, "default", "", "", vec![])
            .await
            .unwrap();
        let responder = repo
            .create_agent(squad.id, Role::TechLead, "default", "", "", vec![])
            .await
            .unwrap();
        repo.create_rule(squad.id, Role::BackendDeveloper, "implementation", 0, Role::TechLead, 10)
            .await
            .unwrap();

        let events: Arc<dyn EventHandler> = Arc::new(NoopEventHandler);
        let bus = Arc::new(MessageBus::new(store.clone(), 16, 3, events.clone()));
        let conversations = ConversationMachine::new(
            store.clone(),
            repo.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            events.clone(),
            bus.clone(),
        );

        let responder_inbound = bus.register_agent(responder.id, squad.id).await.unwrap();
        let runtime = AgentRuntime::new(
            responder.id,
            squad.id,
            Role::TechLead,
            "You are a tech lead.".to_string(),
            Arc::new(EchoGenerator {
                reply: "Use Redis.".to_string(),
            }),
            None,
            vec![],
            bus.clone(),
            conversations.clone(),
            store.clone(),
            8,
            50,
            events.clone(),
        );
        tokio::spawn(runtime.run(responder_inbound));

        conversations
            .open(squad.id, asker.id, "implementation", "Redis or Memcached?", HashMap::new(), None)
            .await
            .unwrap();

        // give the spawned runtime a turn to process the question.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let conversation = repo
            .list_waiting_conversations()
            .await
            .unwrap();
        assert!(conversation.is_empty(), "conversation should have moved out of waiting");
    }
}
