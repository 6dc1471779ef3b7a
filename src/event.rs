//! Process-local observability callbacks.
//!
//! This is deliberately separate from [`crate::store`] (the durable Event
//! Log, the system's source of truth): [`RuntimeEvent`]s are a live,
//! non-durable feed for logging/metrics/dashboards, fired alongside —
//! never instead of — a committed [`crate::model::ConversationEvent`].
//! Losing a `RuntimeEvent` (e.g. no handler registered) never loses data;
//! losing a `ConversationEvent` would.
//!
//! # Example
//!
//! ```rust,no_run
//! use squadron::event::{EventHandler, RuntimeEvent};
//! use async_trait::async_trait;
//!
//! struct LoggingHandler;
//!
//! #[async_trait]
//! impl EventHandler for LoggingHandler {
//!     async fn on_event(&self, event: &RuntimeEvent) {
//!         log::debug!("{:?}", event);
//!     }
//! }
//! ```

use crate::model::ConversationState;
use async_trait::async_trait;
use uuid::Uuid;

/// Notable things that happen while the runtime is running, for logging and
/// metrics. Not persisted; not replayed on restart.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// C2 resolved (or failed to resolve) a responder.
    RoutingDecided {
        squad_id: Uuid,
        asker_role: String,
        question_type: String,
        escalation_level: i64,
        responder_agent_id: Option<Uuid>,
    },
    /// C4 committed a state transition.
    ConversationTransitioned {
        conversation_id: Uuid,
        from: ConversationState,
        to: ConversationState,
        reason: String,
    },
    /// C4 opened a child conversation on escalation.
    ConversationEscalated {
        parent_id: Uuid,
        child_id: Uuid,
        new_level: i64,
    },
    /// C3 enqueued a message into a recipient's inbound queue.
    MessageDelivered {
        message_id: Uuid,
        recipient_agent_id: Uuid,
    },
    /// C3 retried after a full inbound queue.
    BusBackpressure {
        recipient_agent_id: Uuid,
        attempt: usize,
    },
    /// C5 failed to generate a reply and recorded `human_intervention_required`.
    GeneratorFailed {
        agent_id: Uuid,
        conversation_id: Option<Uuid>,
        reason: String,
    },
    /// C7 accepted a new SSE subscriber.
    SseSubscribed { scope: String },
    /// C7 dropped a subscriber for falling behind its buffer.
    SseSlowConsumer { scope: String },
}

/// Receives [`RuntimeEvent`]s. There is a single entrypoint, since this
/// runtime has one event stream, not a split agent/orchestration pair;
/// it defaults to a no-op so callers only implement what they use.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: &RuntimeEvent) {}
}

/// An [`EventHandler`] that does nothing, used when no observer is wired up.
pub struct NoopEventHandler;

#[async_trait]
impl EventHandler for NoopEventHandler {
    async fn on_event(&self, _event: &RuntimeEvent) {}
}

/// An [`EventHandler`] that logs every event at `debug` level via the `log`
/// facade.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: &RuntimeEvent) {
        log::debug!("runtime event: {:?}", event);
    }
}
