//! `TextGenerator` — the opaque LLM capability.
//!
//! A provider-agnostic trait abstracting over concrete vendor clients,
//! reduced to the single `generate` entrypoint an agent runtime actually
//! needs. Vendor wire formats, streaming chunk plumbing, and token
//! accounting are an external collaborator's problem — an LLM inference
//! backend is opaque to everything that calls through this trait.

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

/// One turn of conversation history fed to a generator call.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub role: GeneratorRole,
    pub content: String,
}

/// Coarse role tag for generator history, distinct from [`crate::model::Role`]
/// (an agent's squad role) — this is the chat-turn role a vendor API expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation the generator asked the runtime to perform, to be
/// routed through a [`crate::tool::ToolInvoker`].
#[derive(Debug, Clone)]
pub struct GeneratorToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The names of tools the generator is permitted to request this turn,
/// already filtered by the calling agent's ACL.
pub type ToolsAllowed<'a> = &'a [String];

/// A single opaque call: history in, reply + requested tool calls out. Any
/// LLM vendor is pluggable behind this trait; the runtime never inspects a
/// concrete implementation.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        conversation_history: &[HistoryTurn],
        tools_allowed: ToolsAllowed<'_>,
    ) -> Result<(String, Vec<GeneratorToolCall>), Box<dyn Error + Send + Sync>>;

    /// Display name for logging, mirroring `ClientWrapper::model_name`.
    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// Resolves an [`crate::model::Agent::generator_ref`] (an opaque handle,
/// e.g. `{"vendor": "...", "model": "...", "temperature": 0.7}`) to a live
/// [`TextGenerator`]. A real deployment plugs in vendor-specific clients
/// keyed by `generatorRef`'s `vendor`/`model` fields via `GENERATOR_*`
/// configuration; `agent_runtime` only depends on this trait so that
/// binding is swappable without touching its dispatch loop.
pub trait GeneratorFactory: Send + Sync {
    fn resolve(&self, generator_ref: &str) -> Arc<dyn TextGenerator>;
}

/// The factory the binary falls back to when no vendor-specific
/// `GeneratorFactory` is wired in: every `generatorRef` resolves to a fixed
/// reply naming the unresolved ref, so the system is runnable end-to-end
/// (conversations still advance through their state machine) without
/// requiring real model credentials.
pub struct EchoGeneratorFactory;

impl GeneratorFactory for EchoGeneratorFactory {
    fn resolve(&self, generator_ref: &str) -> Arc<dyn TextGenerator> {
        Arc::new(EchoGenerator {
            reply: format!(
                "[no TextGenerator backend bound for generatorRef '{generator_ref}'; \
                 configure one via GENERATOR_* and a custom GeneratorFactory]"
            ),
        })
    }
}

/// A deterministic [`TextGenerator`] for tests and local development: always
/// returns a fixed reply and never requests tool calls.
pub struct EchoGenerator {
    pub reply: String,
}

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate(
        &self,
        _system_prompt: &str,
        _conversation_history: &[HistoryTurn],
        _tools_allowed: ToolsAllowed<'_>,
    ) -> Result<(String, Vec<GeneratorToolCall>), Box<dyn Error + Send + Sync>> {
        Ok((self.reply.clone(), vec![]))
    }

    fn model_name(&self) -> &str {
        "echo"
    }
}
