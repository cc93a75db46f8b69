//! Tool trait, capability descriptors and call results.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::llm::ToolDefinition;
use crate::tenant::TenantContext;

/// Which kind of actor is calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Director,
    Agent,
}

/// Visibility flags for a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolCapabilities {
    /// Always offered, regardless of allowlists.
    pub mandatory: bool,
    /// Offered unless the role excludes it.
    pub default_enabled: bool,
    /// Never offered to agents.
    pub director_only: bool,
}

impl ToolCapabilities {
    pub fn mandatory() -> Self {
        Self {
            mandatory: true,
            default_enabled: true,
            director_only: false,
        }
    }

    pub fn default_enabled() -> Self {
        Self {
            mandatory: false,
            default_enabled: true,
            director_only: false,
        }
    }

    pub fn director_only(mut self) -> Self {
        self.director_only = true;
        self
    }
}

/// Whether a tool with `caps` is visible to `role`. `director_only` wins
/// over `mandatory`: agents never see a director-only tool.
pub fn is_visible(caps: ToolCapabilities, role: ActorRole) -> bool {
    if role == ActorRole::Agent && caps.director_only {
        return false;
    }
    caps.mandatory || caps.default_enabled
}

/// Per-call context handed to tool handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub tenant: TenantContext,
    pub role: ActorRole,
    /// Director or agent id.
    pub actor_id: String,
    pub thread_id: String,
    pub trace_id: Option<String>,
    /// Extra restriction on non-mandatory tools. Empty means none.
    pub allowlist: Vec<String>,
}

impl ToolContext {
    /// Whether a tool named `name` with `caps` may be offered and called.
    pub fn permits(&self, name: &str, caps: ToolCapabilities) -> bool {
        if !is_visible(caps, self.role) {
            return false;
        }
        caps.mandatory || self.allowlist.is_empty() || self.allowlist.iter().any(|n| n == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallKind {
    Tool,
    Agent,
}

/// Outcome of one dispatched call, as appended to the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub kind: ToolCallKind,
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn ok(kind: ToolCallKind, result: serde_json::Value) -> Self {
        Self {
            kind,
            success: true,
            result,
            error: None,
        }
    }

    pub fn failed(kind: ToolCallKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            success: false,
            result: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    /// JSON body for the tool message.
    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"success\":false}".to_string())
    }
}

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities::default_enabled()
    }

    /// Overrides the dispatcher's default timeout.
    fn execution_timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Required string parameter.
pub fn require_str<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments {
            name: tool.to_string(),
            reason: format!("missing string parameter '{key}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_rules() {
        let mandatory = ToolCapabilities::mandatory();
        let default = ToolCapabilities::default_enabled();
        let director = ToolCapabilities::default_enabled().director_only();
        let hidden = ToolCapabilities::default();

        assert!(is_visible(mandatory, ActorRole::Agent));
        assert!(is_visible(default, ActorRole::Agent));
        assert!(is_visible(director, ActorRole::Director));
        assert!(!is_visible(director, ActorRole::Agent));
        assert!(!is_visible(hidden, ActorRole::Director));

        let pinned = ToolCapabilities::mandatory().director_only();
        assert!(is_visible(pinned, ActorRole::Director));
        assert!(!is_visible(pinned, ActorRole::Agent));
    }

    #[test]
    fn call_result_content_is_json() {
        let result = ToolCallResult::failed(ToolCallKind::Tool, "tool_timeout_50ms");
        let parsed: serde_json::Value = serde_json::from_str(&result.to_content()).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["error"], "tool_timeout_50ms");
        assert_eq!(parsed["kind"], "tool");
    }
}
