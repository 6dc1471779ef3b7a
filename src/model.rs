//! Domain types.
//!
//! Entity ids are [`Uuid`]. Free-form key-value fields use
//! [`serde_json::Value`], the same shape [`crate::tool::ToolResult::metadata`]
//! uses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// An agent's role within a squad. A closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ProjectManager,
    SolutionArchitect,
    TechLead,
    BackendDeveloper,
    FrontendDeveloper,
    QaTester,
    DevopsEngineer,
    AiEngineer,
    Designer,
    DataScientist,
    DataEngineer,
    MlEngineer,
}

impl Role {
    /// Lexicographic ordering key used by the routing engine's tie-break
    /// (smallest responderRole wins a priority tie). Uses the wire name,
    /// not the enum's declared variant order.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ProjectManager => "project_manager",
            Role::SolutionArchitect => "solution_architect",
            Role::TechLead => "tech_lead",
            Role::BackendDeveloper => "backend_developer",
            Role::FrontendDeveloper => "frontend_developer",
            Role::QaTester => "qa_tester",
            Role::DevopsEngineer => "devops_engineer",
            Role::AiEngineer => "ai_engineer",
            Role::Designer => "designer",
            Role::DataScientist => "data_scientist",
            Role::DataEngineer => "data_engineer",
            Role::MlEngineer => "ml_engineer",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        Some(match s {
            "project_manager" => Role::ProjectManager,
            "solution_architect" => Role::SolutionArchitect,
            "tech_lead" => Role::TechLead,
            "backend_developer" => Role::BackendDeveloper,
            "frontend_developer" => Role::FrontendDeveloper,
            "qa_tester" => Role::QaTester,
            "devops_engineer" => Role::DevopsEngineer,
            "ai_engineer" => Role::AiEngineer,
            "designer" => Role::Designer,
            "data_scientist" => Role::DataScientist,
            "data_engineer" => Role::DataEngineer,
            "ml_engineer" => Role::MlEngineer,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named, user-owned container of agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Squad {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

/// One role instance in a squad.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: Uuid,
    pub squad_id: Uuid,
    pub role: Role,
    pub specialization: String,
    /// Opaque handle to a `TextGenerator`; the core never interprets it.
    pub generator_ref: String,
    pub system_prompt: String,
    pub tool_capabilities: Vec<String>,
    pub active: bool,
}

/// A declarative dispatch entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub id: Uuid,
    pub squad_id: Uuid,
    pub asker_role: Role,
    /// `"default"` is the fallback question type.
    pub question_type: String,
    pub escalation_level: i64,
    pub responder_role: Role,
    pub priority: i64,
    pub active: bool,
}

/// Lifecycle states of a [`Conversation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Initiated,
    Waiting,
    Answered,
    Acknowledged,
    Escalated,
    TimedOut,
    Abandoned,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Initiated => "initiated",
            ConversationState::Waiting => "waiting",
            ConversationState::Answered => "answered",
            ConversationState::Acknowledged => "acknowledged",
            ConversationState::Escalated => "escalated",
            ConversationState::TimedOut => "timed_out",
            ConversationState::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<ConversationState> {
        Some(match s {
            "initiated" => ConversationState::Initiated,
            "waiting" => ConversationState::Waiting,
            "answered" => ConversationState::Answered,
            "acknowledged" => ConversationState::Acknowledged,
            "escalated" => ConversationState::Escalated,
            "timed_out" => ConversationState::TimedOut,
            "abandoned" => ConversationState::Abandoned,
            _ => return None,
        })
    }

    /// Terminal states close the conversation (`closedAt` is set).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConversationState::Acknowledged
                | ConversationState::TimedOut
                | ConversationState::Abandoned
        )
    }
}

/// A durable question thread between two agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub squad_id: Uuid,
    pub task_execution_id: Option<Uuid>,
    pub asker_agent_id: Uuid,
    pub current_responder_agent_id: Option<Uuid>,
    pub question_type: String,
    pub escalation_level: i64,
    pub state: ConversationState,
    pub parent_conversation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Kinds of immutable facts recorded in the Event Log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Initiated,
    Answered,
    Acknowledged,
    Escalated,
    TimedOut,
    MessageAppended,
    StateChanged,
    ExternalNote,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Initiated => "initiated",
            EventKind::Answered => "answered",
            EventKind::Acknowledged => "acknowledged",
            EventKind::Escalated => "escalated",
            EventKind::TimedOut => "timed_out",
            EventKind::MessageAppended => "message_appended",
            EventKind::StateChanged => "state_changed",
            EventKind::ExternalNote => "external_note",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        Some(match s {
            "initiated" => EventKind::Initiated,
            "answered" => EventKind::Answered,
            "acknowledged" => EventKind::Acknowledged,
            "escalated" => EventKind::Escalated,
            "timed_out" => EventKind::TimedOut,
            "message_appended" => EventKind::MessageAppended,
            "state_changed" => EventKind::StateChanged,
            "external_note" => EventKind::ExternalNote,
            _ => return None,
        })
    }
}

/// An immutable record of one thing that happened.
///
/// `conversation_id` is `None` only for squad-scoped broadcast events: a
/// broadcast records one `message_appended` event with no conversation.
/// `sequence` is dense and unique within its scope: per `conversation_id`
/// when set, otherwise per `(squad_id, conversation_id IS NULL)` for the
/// squad's broadcast stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    pub id: Uuid,
    pub squad_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub sequence: i64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub author_agent_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

/// The kind of a [`Message`] moved by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Question,
    Answer,
    Acknowledgment,
    Standup,
    TaskAssignment,
    StatusUpdate,
    ReviewRequest,
    ReviewFeedback,
    Completion,
    HumanInterventionRequired,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Question => "question",
            MessageType::Answer => "answer",
            MessageType::Acknowledgment => "acknowledgment",
            MessageType::Standup => "standup",
            MessageType::TaskAssignment => "task_assignment",
            MessageType::StatusUpdate => "status_update",
            MessageType::ReviewRequest => "review_request",
            MessageType::ReviewFeedback => "review_feedback",
            MessageType::Completion => "completion",
            MessageType::HumanInterventionRequired => "human_intervention_required",
            MessageType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<MessageType> {
        Some(match s {
            "question" => MessageType::Question,
            "answer" => MessageType::Answer,
            "acknowledgment" => MessageType::Acknowledgment,
            "standup" => MessageType::Standup,
            "task_assignment" => MessageType::TaskAssignment,
            "status_update" => MessageType::StatusUpdate,
            "review_request" => MessageType::ReviewRequest,
            "review_feedback" => MessageType::ReviewFeedback,
            "completion" => MessageType::Completion,
            "human_intervention_required" => MessageType::HumanInterventionRequired,
            "system" => MessageType::System,
            _ => return None,
        })
    }
}

/// The datagram moved by the bus. Always produces a [`ConversationEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    /// `None` for broadcasts.
    pub conversation_id: Option<Uuid>,
    pub sender_agent_id: Uuid,
    /// `None` for broadcast.
    pub recipient_agent_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A declarative template for atomic squad instantiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SquadTemplate {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub version: String,
    pub agents: Vec<TemplateAgent>,
    #[serde(default, rename = "routingRules")]
    pub routing_rules: Vec<TemplateRoutingRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateAgent {
    pub role: Role,
    #[serde(default = "default_specialization")]
    pub specialization: String,
    #[serde(rename = "generatorRef", default)]
    pub generator_ref: serde_json::Value,
    #[serde(rename = "systemPromptRef", default)]
    pub system_prompt_ref: String,
    #[serde(rename = "toolCapabilities", default)]
    pub tool_capabilities: Vec<String>,
}

fn default_specialization() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRoutingRule {
    #[serde(rename = "askerRole")]
    pub asker_role: Role,
    #[serde(rename = "questionType")]
    pub question_type: String,
    #[serde(rename = "escalationLevel")]
    pub escalation_level: i64,
    #[serde(rename = "responderRole")]
    pub responder_role: Role,
    pub priority: i64,
}

/// Per-agent customization overrides accepted by `applyTemplate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateCustomization {
    #[serde(default)]
    pub agents: Vec<AgentOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOverride {
    pub role: Role,
    pub specialization: Option<String>,
    #[serde(rename = "generatorRef")]
    pub generator_ref: Option<serde_json::Value>,
    #[serde(rename = "systemPromptRef")]
    pub system_prompt_ref: Option<String>,
    #[serde(rename = "toolCapabilities")]
    pub tool_capabilities: Option<Vec<String>>,
}
