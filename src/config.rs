//! Process configuration.
//!
//! No config-file parsing dependency: a plain struct with a sane
//! [`Default`], populated from environment variables at startup.

use std::time::Duration;

/// Global runtime configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the Event Log (C1). Defaults to an in-memory
    /// database so the binary runs with zero configuration.
    pub database_url: String,

    /// `waiting -> escalated|timed_out` timer duration (C4).
    pub answer_timeout: Duration,

    /// `answered -> abandoned` timer duration (C4).
    pub ack_timeout: Duration,

    /// Interval between SSE heartbeat frames (C7).
    pub sse_heartbeat: Duration,

    /// Per-client bounded buffer size before a subscriber is dropped as a
    /// `SlowConsumer` (C7).
    pub sse_client_buffer: usize,

    /// Maximum `generate`/tool-call iterations per inbound message (C5).
    pub agent_step_budget: usize,

    /// Number of trailing timeline events loaded as conversation history
    /// before each `generate` call (C5).
    pub agent_history_window: usize,

    /// Bounded capacity of each agent's inbound queue (C3).
    pub bus_queue_capacity: usize,

    /// Max retry attempts before a `Backpressure` failure becomes a
    /// recorded `system` event (C3).
    pub bus_retry_budget: usize,

    /// Address the public HTTP API binds to.
    pub http_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            answer_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(120),
            sse_heartbeat: Duration::from_secs(15),
            sse_client_buffer: 256,
            agent_step_budget: 8,
            agent_history_window: 50,
            bus_queue_capacity: 256,
            bus_retry_budget: 5,
            http_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    /// Builds configuration from the environment, falling back to
    /// [`Default`] for any key that is unset or fails to parse.
    ///
    /// `MESSAGE_BUS` is read but otherwise unused: only the in-process bus
    /// variant is supported, so any value other than `memory` is rejected
    /// at startup rather than silently ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        if let Ok(bus) = std::env::var("MESSAGE_BUS") {
            if bus != "memory" {
                log::warn!(
                    "MESSAGE_BUS={bus} is not supported; only the in-process \
                     variant is implemented, falling back to it"
                );
            }
        }

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            answer_timeout: env_secs("ANSWER_TIMEOUT_SECONDS", defaults.answer_timeout),
            ack_timeout: env_secs("ACK_TIMEOUT_SECONDS", defaults.ack_timeout),
            sse_heartbeat: env_secs("SSE_HEARTBEAT_SECONDS", defaults.sse_heartbeat),
            sse_client_buffer: env_usize("SSE_CLIENT_BUFFER", defaults.sse_client_buffer),
            agent_step_budget: env_usize("AGENT_STEP_BUDGET", defaults.agent_step_budget),
            agent_history_window: env_usize(
                "AGENT_HISTORY_WINDOW",
                defaults.agent_history_window,
            ),
            bus_queue_capacity: defaults.bus_queue_capacity,
            bus_retry_budget: defaults.bus_retry_budget,
            http_addr: std::env::var("HTTP_ADDR").unwrap_or(defaults.http_addr),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_zero_configuration_database() {
        let config = Config::default();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.answer_timeout, Duration::from_secs(60));
        assert_eq!(config.ack_timeout, Duration::from_secs(120));
    }
}
