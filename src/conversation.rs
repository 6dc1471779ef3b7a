//! C4 — the Conversation State Machine & escalation engine.
//!
//! A per-conversation `Mutex` keyed by id makes the
//! `(read-state, decide, append-event, update-state)` sequence
//! linearizable: two concurrent writers to the same conversation never
//! interleave their transition, even though different conversations
//! proceed fully in parallel.

use crate::bus::MessageBus;
use crate::error::{Error, Result};
use crate::event::{EventHandler, RuntimeEvent};
use crate::model::{Conversation, ConversationState, EventKind, Message, MessageType};
use crate::repo::Repo;
use crate::routing;
use crate::store::EventStore;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use uuid::Uuid;

/// Drives every conversation's lifecycle. One instance is shared across the
/// process; per-conversation exclusivity comes from the lock registry, not
/// from one task per conversation (timers are separate spawned tasks that
/// re-validate state on wake, per the idempotent-transition contract below).
pub struct ConversationMachine {
    store: EventStore,
    repo: Repo,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    answer_timeout: Duration,
    ack_timeout: Duration,
    events: Arc<dyn EventHandler>,
    bus: Arc<MessageBus>,
}

impl ConversationMachine {
    pub fn new(
        store: EventStore,
        repo: Repo,
        answer_timeout: Duration,
        ack_timeout: Duration,
        events: Arc<dyn EventHandler>,
        bus: Arc<MessageBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            repo,
            locks: DashMap::new(),
            answer_timeout,
            ack_timeout,
            events,
            bus,
        })
    }

    fn lock_for(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Opens a new conversation: resolves a level-0 responder via C2,
    /// creates the row, appends `initiated`, transitions to `waiting`, and
    /// appends the opening question as a `message_appended` event. Returns
    /// `NoResponder` (and creates nothing) if C2 can't resolve a responder.
    pub async fn open(
        self: &Arc<Self>,
        squad_id: Uuid,
        asker_agent_id: Uuid,
        question_type: &str,
        content: &str,
        metadata: HashMap<String, serde_json::Value>,
        task_execution_id: Option<Uuid>,
    ) -> Result<Conversation> {
        let asker = self.repo.get_agent(asker_agent_id).await?;
        let agents = self.repo.list_agents(squad_id).await?;
        let rules = self.repo.list_rules(squad_id).await?;

        let specialization_hint = metadata
            .get("specialization")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let responder = routing::route(
            &rules,
            &agents,
            asker.role,
            question_type,
            0,
            specialization_hint.as_deref(),
        )
        .ok_or_else(|| Error::NoResponder {
            asker_role: asker.role.to_string(),
            question_type: question_type.to_string(),
            escalation_level: 0,
        })?;

        let conversation = self
            .repo
            .create_conversation(
                squad_id,
                task_execution_id,
                asker_agent_id,
                Some(responder),
                question_type,
                0,
                None,
            )
            .await?;

        self.store
            .append(
                squad_id,
                Some(conversation.id),
                EventKind::Initiated,
                serde_json::json!({ "askerAgentId": asker_agent_id, "responderAgentId": responder }),
                Some(asker_agent_id),
            )
            .await?;

        self.do_transition(
            conversation.id,
            squad_id,
            ConversationState::Initiated,
            ConversationState::Waiting,
            None,
            None,
            "responder set, question delivered",
        )
        .await?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Some(conversation.id),
            sender_agent_id: asker_agent_id,
            recipient_agent_id: Some(responder),
            message_type: MessageType::Question,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        };
        self.bus.publish(squad_id, message).await?;

        self.spawn_answer_timeout(squad_id, conversation.id, 0);

        self.repo.get_conversation(conversation.id).await
    }

    /// Records an answer: `waiting -> answered`. Spawns the ack timer.
    pub async fn answer(
        self: &Arc<Self>,
        conversation_id: Uuid,
        responder_agent_id: Uuid,
        content: &str,
    ) -> Result<()> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let conversation = self.repo.get_conversation(conversation_id).await?;
        if conversation.state == ConversationState::Answered {
            return Ok(()); // idempotent retry of the same transition
        }
        if conversation.state != ConversationState::Waiting {
            return Err(Error::IllegalTransition(format!(
                "cannot answer from state {}",
                conversation.state.as_str()
            )));
        }

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Some(conversation_id),
            sender_agent_id: responder_agent_id,
            recipient_agent_id: Some(conversation.asker_agent_id),
            message_type: MessageType::Answer,
            content: content.to_string(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        };
        self.bus.publish(conversation.squad_id, message).await?;

        self.store
            .append(
                conversation.squad_id,
                Some(conversation_id),
                EventKind::Answered,
                serde_json::json!({ "responderAgentId": responder_agent_id }),
                Some(responder_agent_id),
            )
            .await?;

        self.repo
            .update_conversation_state(conversation_id, ConversationState::Answered, None, None, false)
            .await?;
        self.emit_transition(conversation_id, ConversationState::Waiting, ConversationState::Answered, "answer received")
            .await;

        self.spawn_ack_timeout(conversation.squad_id, conversation_id);
        Ok(())
    }

    /// Records an acknowledgment: `answered -> acknowledged` (terminal).
    pub async fn acknowledge(self: &Arc<Self>, conversation_id: Uuid, acker_agent_id: Uuid) -> Result<()> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let conversation = self.repo.get_conversation(conversation_id).await?;
        if conversation.state == ConversationState::Acknowledged {
            return Ok(());
        }
        if conversation.state != ConversationState::Answered {
            return Err(Error::IllegalTransition(format!(
                "cannot acknowledge from state {}",
                conversation.state.as_str()
            )));
        }

        self.store
            .append(
                conversation.squad_id,
                Some(conversation_id),
                EventKind::Acknowledged,
                serde_json::json!({ "ackerAgentId": acker_agent_id }),
                Some(acker_agent_id),
            )
            .await?;
        self.repo
            .update_conversation_state(conversation_id, ConversationState::Acknowledged, None, None, true)
            .await?;
        self.emit_transition(
            conversation_id,
            ConversationState::Answered,
            ConversationState::Acknowledged,
            "acknowledgment received",
        )
        .await;
        Ok(())
    }

    /// A follow-up question while `answered`: returns to `waiting` without
    /// opening a new conversation id.
    pub async fn follow_up(
        self: &Arc<Self>,
        conversation_id: Uuid,
        asker_agent_id: Uuid,
        content: &str,
    ) -> Result<()> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let conversation = self.repo.get_conversation(conversation_id).await?;
        if conversation.state == ConversationState::Waiting {
            return Ok(());
        }
        if conversation.state != ConversationState::Answered {
            return Err(Error::IllegalTransition(format!(
                "cannot follow up from state {}",
                conversation.state.as_str()
            )));
        }
        let responder = conversation
            .current_responder_agent_id
            .ok_or_else(|| Error::Invalid("conversation has no current responder".to_string()))?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Some(conversation_id),
            sender_agent_id: asker_agent_id,
            recipient_agent_id: Some(responder),
            message_type: MessageType::Question,
            content: content.to_string(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        };
        self.bus.publish(conversation.squad_id, message).await?;

        self.do_transition(
            conversation_id,
            conversation.squad_id,
            ConversationState::Answered,
            ConversationState::Waiting,
            None,
            None,
            "follow-up question",
        )
        .await?;

        self.spawn_answer_timeout(conversation.squad_id, conversation_id, conversation.escalation_level);
        Ok(())
    }

    /// Explicit escalation trigger, in addition to the timeout path below.
    /// Unlike the timer/recovery path, an explicit caller gets a hard
    /// `IllegalTransition` rather than a silent no-op when the conversation
    /// isn't currently `waiting`.
    pub async fn escalate(self: &Arc<Self>, conversation_id: Uuid) -> Result<Option<Conversation>> {
        let conversation = self.repo.get_conversation(conversation_id).await?;
        if conversation.state != ConversationState::Waiting {
            return Err(Error::IllegalTransition(format!(
                "cannot escalate from state {}",
                conversation.state.as_str()
            )));
        }
        self.handle_answer_timeout_inner(conversation_id, "explicit escalate()").await
    }

    fn spawn_answer_timeout(self: &Arc<Self>, _squad_id: Uuid, conversation_id: Uuid, _level: i64) {
        let machine = Arc::clone(self);
        let duration = self.answer_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = machine
                .handle_answer_timeout_inner(conversation_id, "answerTimeout elapsed")
                .await
            {
                log::warn!("answer timeout handling failed for {conversation_id}: {e}");
            }
        });
    }

    fn spawn_ack_timeout(self: &Arc<Self>, _squad_id: Uuid, conversation_id: Uuid) {
        let machine = Arc::clone(self);
        let duration = self.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = machine.handle_ack_timeout(conversation_id).await {
                log::warn!("ack timeout handling failed for {conversation_id}: {e}");
            }
        });
    }

    /// `waiting -> escalated` (opening a child conversation) or
    /// `waiting -> timed_out`, fired either by the answer timer or by an
    /// explicit `escalate()` call. A no-op if the conversation has already
    /// left `waiting` — timers don't carry cancellation handles, they
    /// simply re-check state on wake, which also makes this safe to call
    /// twice.
    async fn handle_answer_timeout_inner(
        self: &Arc<Self>,
        conversation_id: Uuid,
        reason: &str,
    ) -> Result<Option<Conversation>> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let conversation = self.repo.get_conversation(conversation_id).await?;
        if conversation.state != ConversationState::Waiting {
            return Ok(None);
        }

        let asker = self.repo.get_agent(conversation.asker_agent_id).await?;
        let agents = self.repo.list_agents(conversation.squad_id).await?;
        let rules = self.repo.list_rules(conversation.squad_id).await?;
        let next_level = conversation.escalation_level + 1;

        let next_responder = routing::route(
            &rules,
            &agents,
            asker.role,
            &conversation.question_type,
            next_level,
            None,
        );

        match next_responder {
            Some(responder) => {
                self.store
                    .append(
                        conversation.squad_id,
                        Some(conversation_id),
                        EventKind::Escalated,
                        serde_json::json!({ "reason": reason, "nextLevel": next_level }),
                        None,
                    )
                    .await?;
                self.repo
                    .update_conversation_state(conversation_id, ConversationState::Escalated, None, None, false)
                    .await?;
                self.emit_transition(conversation_id, ConversationState::Waiting, ConversationState::Escalated, reason)
                    .await;

                let child = self
                    .repo
                    .create_conversation(
                        conversation.squad_id,
                        conversation.task_execution_id,
                        conversation.asker_agent_id,
                        Some(responder),
                        &conversation.question_type,
                        next_level,
                        Some(conversation_id),
                    )
                    .await?;

                self.store
                    .append(
                        conversation.squad_id,
                        Some(child.id),
                        EventKind::Initiated,
                        serde_json::json!({
                            "escalatedFrom": conversation_id,
                            "askerAgentId": conversation.asker_agent_id,
                            "responderAgentId": responder,
                        }),
                        Some(conversation.asker_agent_id),
                    )
                    .await?;
                self.do_transition(
                    child.id,
                    conversation.squad_id,
                    ConversationState::Initiated,
                    ConversationState::Waiting,
                    None,
                    None,
                    "escalated: responder set, question delivered",
                )
                .await?;

                // the escalated conversation carries the original question's
                // own content forward as its opening message; the full prior
                // exchange is still reachable through `parent_conversation_id`.
                let original_question = self.store.first_message_for_conversation(conversation_id).await?;
                let message = Message {
                    id: Uuid::new_v4(),
                    conversation_id: Some(child.id),
                    sender_agent_id: conversation.asker_agent_id,
                    recipient_agent_id: Some(responder),
                    message_type: MessageType::Question,
                    content: original_question.content,
                    metadata: HashMap::new(),
                    created_at: Utc::now(),
                };
                self.bus.publish(conversation.squad_id, message).await?;

                self.events
                    .on_event(&RuntimeEvent::ConversationEscalated {
                        parent_id: conversation_id,
                        child_id: child.id,
                        new_level: next_level,
                    })
                    .await;

                self.spawn_answer_timeout(conversation.squad_id, child.id, next_level);

                Ok(Some(self.repo.get_conversation(child.id).await?))
            }
            None => {
                self.store
                    .append(
                        conversation.squad_id,
                        Some(conversation_id),
                        EventKind::TimedOut,
                        serde_json::json!({ "reason": reason }),
                        None,
                    )
                    .await?;
                self.repo
                    .update_conversation_state(conversation_id, ConversationState::TimedOut, None, None, true)
                    .await?;
                self.emit_transition(conversation_id, ConversationState::Waiting, ConversationState::TimedOut, reason)
                    .await;
                Ok(None)
            }
        }
    }

    /// `answered -> abandoned` (terminal), fired by the ack timer.
    async fn handle_ack_timeout(self: &Arc<Self>, conversation_id: Uuid) -> Result<()> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let conversation = self.repo.get_conversation(conversation_id).await?;
        if conversation.state != ConversationState::Answered {
            return Ok(());
        }

        self.store
            .append(
                conversation.squad_id,
                Some(conversation_id),
                EventKind::StateChanged,
                serde_json::json!({
                    "from": ConversationState::Answered.as_str(),
                    "to": ConversationState::Abandoned.as_str(),
                    "reason": "ackTimeout elapsed",
                }),
                None,
            )
            .await?;
        self.repo
            .update_conversation_state(conversation_id, ConversationState::Abandoned, None, None, true)
            .await?;
        self.emit_transition(
            conversation_id,
            ConversationState::Answered,
            ConversationState::Abandoned,
            "ackTimeout elapsed",
        )
        .await;
        Ok(())
    }

    /// Appends the `state_changed` event and updates the row for a plain
    /// (non-terminal-decision) transition, used by `open()`'s
    /// `initiated -> waiting` step.
    async fn do_transition(
        &self,
        conversation_id: Uuid,
        squad_id: Uuid,
        from: ConversationState,
        to: ConversationState,
        responder: Option<Uuid>,
        level: Option<i64>,
        reason: &str,
    ) -> Result<()> {
        self.store
            .append(
                squad_id,
                Some(conversation_id),
                EventKind::StateChanged,
                serde_json::json!({ "from": from.as_str(), "to": to.as_str(), "reason": reason }),
                None,
            )
            .await?;
        self.repo
            .update_conversation_state(conversation_id, to, responder, level, to.is_terminal())
            .await?;
        self.emit_transition(conversation_id, from, to, reason).await;
        Ok(())
    }

    async fn emit_transition(
        &self,
        conversation_id: Uuid,
        from: ConversationState,
        to: ConversationState,
        reason: &str,
    ) {
        self.events
            .on_event(&RuntimeEvent::ConversationTransitioned {
                conversation_id,
                from,
                to,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Startup crash-recovery sweep: conversations left `waiting` whose
    /// `updated_at + answerTimeout` has already elapsed are transitioned as
    /// if their timer had fired.
    pub async fn recover(self: &Arc<Self>) -> Result<()> {
        let now = Utc::now();
        for conversation in self.repo.list_waiting_conversations().await? {
            let deadline = conversation.updated_at
                + chrono::Duration::from_std(self.answer_timeout).unwrap_or_default();
            if deadline <= now {
                self.handle_answer_timeout_inner(conversation.id, "recovered overdue answerTimeout")
                    .await?;
            } else {
                let remaining = (deadline - now)
                    .to_std()
                    .unwrap_or(Duration::from_secs(0));
                let machine = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(remaining).await;
                    let _ = machine
                        .handle_answer_timeout_inner(conversation.id, "answerTimeout elapsed")
                        .await;
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NoopEventHandler;
    use crate::model::Role;

    async fn setup() -> (Arc<ConversationMachine>, Repo, Uuid, Uuid, Uuid) {
        let store = EventStore::connect("sqlite::memory:").await.unwrap();
        let repo = Repo::new(store.pool().clone());
        let squad = repo.create_squad(Uuid::new_v4(), "eng", None).await.unwrap();
        let backend = repo
            .create_agent(squad.id, Role::BackendDeveloper, "default", "", "", vec![])
            .await
            .unwrap();
        let lead = repo
            .create_agent(squad.id, Role::TechLead, "default", "", "", vec![])
            .await
            .unwrap();
        repo.create_rule(squad.id, Role::BackendDeveloper, "implementation", 0, Role::TechLead, 10)
            .await
            .unwrap();

        let events: Arc<dyn EventHandler> = Arc::new(NoopEventHandler);
        let bus = Arc::new(crate::bus::MessageBus::new(store.clone(), 16, 3, events.clone()));
        let machine = ConversationMachine::new(
            store,
            repo.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            events,
            bus,
        );
        (machine, repo, squad.id, backend.id, lead.id)
    }

    #[tokio::test]
    async fn single_hop_question_answer_ack() {
        let (machine, repo, squad_id, backend, lead) = setup().await;

        let conversation = machine
            .open(squad_id, backend, "implementation", "Redis vs Memcached?", HashMap::new(), None)
            .await
            .unwrap();
        let conversation = repo.get_conversation(conversation.id).await.unwrap();
        assert_eq!(conversation.state, ConversationState::Waiting);
        assert_eq!(conversation.current_responder_agent_id, Some(lead));

        machine.answer(conversation.id, lead, "Use Redis.").await.unwrap();
        let conversation = repo.get_conversation(conversation.id).await.unwrap();
        assert_eq!(conversation.state, ConversationState::Answered);

        machine.acknowledge(conversation.id, backend).await.unwrap();
        let conversation = repo.get_conversation(conversation.id).await.unwrap();
        assert_eq!(conversation.state, ConversationState::Acknowledged);
        assert!(conversation.closed_at.is_some());
    }

    #[tokio::test]
    async fn no_responder_creates_no_conversation() {
        let (machine, _repo, squad_id, _backend, _lead) = setup().await;
        let qa = Uuid::new_v4();
        let err = machine
            .open(squad_id, qa, "test_strategy", "how?", HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoResponder");
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let (machine, _repo, squad_id, backend, lead) = setup().await;
        let conversation = machine
            .open(squad_id, backend, "implementation", "q", HashMap::new(), None)
            .await
            .unwrap();

        // acknowledging before an answer exists is illegal.
        let err = machine.acknowledge(conversation.id, backend).await.unwrap_err();
        assert_eq!(err.code(), "IllegalTransition");

        machine.answer(conversation.id, lead, "a").await.unwrap();
        // answering twice is an idempotent no-op, not an error.
        machine.answer(conversation.id, lead, "a").await.unwrap();
    }

    #[tokio::test]
    async fn escalate_on_a_non_waiting_conversation_is_rejected() {
        let (machine, _repo, squad_id, backend, lead) = setup().await;
        let conversation = machine
            .open(squad_id, backend, "implementation", "q", HashMap::new(), None)
            .await
            .unwrap();
        machine.answer(conversation.id, lead, "a").await.unwrap();

        let err = machine.escalate(conversation.id).await.unwrap_err();
        assert_eq!(err.code(), "IllegalTransition");
    }
}
