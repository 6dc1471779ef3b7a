//! C7 — live-stream fan-out over Server-Sent Events.
//!
//! A broadcast-hub idiom: subscribe once, replay a backlog, then tee live
//! events to bounded per-client buffers that drop slow consumers rather
//! than let one stalled reader backpressure every other subscriber.

use crate::event::{EventHandler, RuntimeEvent};
use crate::repo::Repo;
use crate::store::{EventStore, LogEntry};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

const BACKLOG_LIMIT: i64 = 10_000;

#[derive(Clone)]
pub struct SseBroker {
    store: EventStore,
    repo: Repo,
    heartbeat: Duration,
    client_buffer: usize,
    events: Arc<dyn EventHandler>,
}

impl SseBroker {
    pub fn new(
        store: EventStore,
        repo: Repo,
        heartbeat: Duration,
        client_buffer: usize,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            store,
            repo,
            heartbeat,
            client_buffer,
            events,
        }
    }

    /// Every event in `squad_id`, resuming after `last_event_id` when given
    /// (the `Last-Event-ID` header or its `lastEventId` query equivalent).
    pub fn squad_stream(
        &self,
        squad_id: Uuid,
        last_event_id: Option<i64>,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        self.stream_filtered(squad_id, last_event_id, None)
    }

    /// Every event belonging to conversations opened under one
    /// `task_execution_id` — the full escalation tree for a single
    /// orchestrated task.
    pub fn execution_stream(
        &self,
        squad_id: Uuid,
        task_execution_id: Uuid,
        last_event_id: Option<i64>,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        self.stream_filtered(squad_id, last_event_id, Some(task_execution_id))
    }

    fn stream_filtered(
        &self,
        squad_id: Uuid,
        last_event_id: Option<i64>,
        task_execution_id: Option<Uuid>,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        let store = self.store.clone();
        let repo = self.repo.clone();
        let heartbeat = self.heartbeat;
        let events = self.events.clone();
        let (tx, rx) = mpsc::channel(self.client_buffer);

        tokio::spawn(async move {
            // Subscribe before reading the backlog so no event committed in
            // between is lost.
            let mut tail = store.tail();

            let after = last_event_id.unwrap_or(0);
            let backlog = match store.read_squad_log_since(squad_id, after, BACKLOG_LIMIT).await {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("sse: failed to load backlog for squad {squad_id}: {e}");
                    Vec::new()
                }
            };
            let mut last_sent = after;
            for entry in backlog {
                last_sent = entry.log_id;
                if !matches_execution(&repo, &entry, task_execution_id).await {
                    continue;
                }
                if send_event(&tx, &store, &repo, &entry).await.is_err() {
                    return;
                }
            }

            events
                .on_event(&RuntimeEvent::SseSubscribed {
                    scope: format!("squad:{squad_id}"),
                })
                .await;

            let mut ticks = tokio::time::interval(heartbeat);
            ticks.tick().await; // first tick fires immediately; discard it

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        if tx.try_send(Ok(Event::default().event("heartbeat").data("{}"))).is_err() {
                            events.on_event(&RuntimeEvent::SseSlowConsumer { scope: format!("squad:{squad_id}") }).await;
                            return;
                        }
                    }
                    entry = tail.recv() => {
                        let entry = match entry {
                            Ok(entry) => entry,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        };
                        if entry.event.squad_id != squad_id || entry.log_id <= last_sent {
                            continue;
                        }
                        if !matches_execution(&repo, &entry, task_execution_id).await {
                            continue;
                        }
                        last_sent = entry.log_id;
                        if send_event(&tx, &store, &repo, &entry).await.is_err() {
                            events.on_event(&RuntimeEvent::SseSlowConsumer { scope: format!("squad:{squad_id}") }).await;
                            return;
                        }
                    }
                }
            }
        });

        Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new().interval(heartbeat))
    }
}

async fn matches_execution(repo: &Repo, entry: &LogEntry, task_execution_id: Option<Uuid>) -> bool {
    let Some(wanted) = task_execution_id else {
        return true;
    };
    let Some(conversation_id) = entry.event.conversation_id else {
        return false;
    };
    match repo.get_conversation(conversation_id).await {
        Ok(conversation) => conversation.task_execution_id == Some(wanted),
        Err(_) => false,
    }
}

/// Builds and enqueues one SSE frame for `entry`, using `try_send` so a
/// subscriber whose bounded buffer is full is disconnected (`SlowConsumer`)
/// rather than allowed to backpressure the whole log.
async fn send_event(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    store: &EventStore,
    repo: &Repo,
    entry: &LogEntry,
) -> Result<(), ()> {
    let data = frame_payload(store, repo, entry).await;
    let event = Event::default()
        .id(entry.log_id.to_string())
        .event(entry.event.kind.as_str())
        .data(data.to_string());
    tx.try_send(Ok(event)).map_err(|_| ())
}

/// A `message_appended` event's payload is just `{"messageId": ...}`;
/// pull the full message so the frame carries the complete message body
/// subscribers expect. Every other event kind's payload already carries
/// everything it needs.
async fn frame_payload(store: &EventStore, repo: &Repo, entry: &LogEntry) -> serde_json::Value {
    let event = &entry.event;
    if event.kind == crate::model::EventKind::MessageAppended {
        if let Some(message_id) = event.payload.get("messageId").and_then(|v| v.as_str()) {
            if let Ok(message_id) = Uuid::parse_str(message_id) {
                if let Ok(message) = store.get_message(message_id).await {
                    let sender_role = repo.get_agent(message.sender_agent_id).await.ok().map(|a| a.role.as_str());
                    let recipient_role = match message.recipient_agent_id {
                        Some(r) => repo.get_agent(r).await.ok().map(|a| a.role.as_str()),
                        None => None,
                    };
                    return serde_json::json!({
                        "messageId": message.id,
                        "conversationId": message.conversation_id,
                        "senderAgentId": message.sender_agent_id,
                        "senderRole": sender_role,
                        "recipientAgentId": message.recipient_agent_id,
                        "recipientRole": recipient_role,
                        "type": message.message_type.as_str(),
                        "content": message.content,
                        "metadata": message.metadata,
                        "occurredAt": event.occurred_at,
                        "sequence": event.sequence,
                    });
                }
            }
        }
    }

    serde_json::json!({
        "id": event.id,
        "squadId": event.squad_id,
        "conversationId": event.conversation_id,
        "sequence": event.sequence,
        "kind": event.kind.as_str(),
        "payload": event.payload,
        "authorAgentId": event.author_agent_id,
        "occurredAt": event.occurred_at,
    })
}
