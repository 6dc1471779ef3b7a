//! `ToolInvoker` — the opaque tool-execution capability, gated by a
//! role→tool ACL.
//!
//! `ToolResult` (success/output/error/metadata) and an execute-by-name
//! contract sit behind the trait; a registry implementing it trusts
//! whatever tools are registered and has no concept of a *caller's*
//! permission to invoke a given one. This module adds that as a wrapping
//! decorator, [`AclToolInvoker`], around a plain [`ToolInvoker`] rather
//! than folding ACL logic into the capability trait itself — the
//! sandboxed execution backend stays opaque and swappable.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use std::error::Error as StdError;
use std::sync::Arc;

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(error: String) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error),
            metadata: HashMap::new(),
        }
    }
}

/// Opaque sandboxed tool execution — code execution, git operations,
/// third-party integrations. Out of scope beyond this interface.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolResult, Box<dyn StdError + Send + Sync>>;

    /// Names of tools this invoker can dispatch, independent of any single
    /// caller's ACL.
    fn list_tools(&self) -> Vec<String>;
}

/// Wraps a [`ToolInvoker`] with a fixed set of tool names a given agent is
/// permitted to call — `Agent::tool_capabilities`. Every call is checked
/// before being delegated; a disallowed name fails closed with
/// `PermissionDenied` rather than reaching the inner invoker.
pub struct AclToolInvoker {
    inner: Arc<dyn ToolInvoker>,
    allowed: HashSet<String>,
}

impl AclToolInvoker {
    pub fn new(inner: Arc<dyn ToolInvoker>, allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner,
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Checks the ACL without executing, used by the agent runtime to
    /// reject a tool call before it ever reaches the invoker: a tool ACL
    /// violation fails with `PermissionDenied` and does not advance state.
    pub fn check(&self, tool_name: &str) -> Result<()> {
        if self.allowed.contains(tool_name) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "tool '{tool_name}' is not in this agent's capability set"
            )))
        }
    }

    pub async fn execute(&self, tool_name: &str, arguments: serde_json::Value) -> Result<ToolResult> {
        self.check(tool_name)?;
        self.inner
            .execute(tool_name, arguments)
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))
    }
}

/// A [`ToolInvoker`] for tests: echoes its arguments back as output.
pub struct EchoToolInvoker {
    pub tools: Vec<String>,
}

#[async_trait]
impl ToolInvoker for EchoToolInvoker {
    async fn execute(
        &self,
        _tool_name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolResult, Box<dyn StdError + Send + Sync>> {
        Ok(ToolResult::success(arguments))
    }

    fn list_tools(&self) -> Vec<String> {
        self.tools.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_tools_outside_the_acl() {
        let invoker = AclToolInvoker::new(
            Arc::new(EchoToolInvoker {
                tools: vec!["ticket.create".to_string()],
            }),
            vec!["ticket.create".to_string()],
        );

        assert!(invoker.execute("ticket.create", serde_json::json!({})).await.is_ok());
        let err = invoker
            .execute("shell.exec", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PermissionDenied");
    }
}
