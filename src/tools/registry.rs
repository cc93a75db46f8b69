//! Tool registry and dispatcher.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::error::{ToolError, millis};
use crate::llm::ToolDefinition;
use crate::tools::tool::{Tool, ToolCallKind, ToolCallResult, ToolContext};

/// Names of built-in tools that cannot be shadowed by dynamic registrations.
const PROTECTED_TOOL_NAMES: &[&str] = &["current_time", "log_note", "list_filters"];

/// Prefix reserved for synthesized agent delegation tools.
pub const AGENT_TOOL_PREFIX: &str = "agent__";

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Tracks which names were registered as built-in (protected from shadowing).
    builtin_names: RwLock<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            builtin_names: RwLock::new(HashSet::new()),
        }
    }

    /// Register a tool. Rejects tools that would shadow a built-in or use
    /// the agent delegation prefix.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if name.starts_with(AGENT_TOOL_PREFIX) {
            tracing::warn!(tool = %name, "Rejected tool registration: reserved agent prefix");
            return;
        }
        if self.builtin_names.read().await.contains(&name) {
            tracing::warn!(
                tool = %name,
                "Rejected tool registration: would shadow a built-in tool"
            );
            return;
        }
        self.tools.write().await.insert(name.clone(), tool);
        tracing::debug!("Registered tool: {}", name);
    }

    /// Register a tool (sync version for startup, marks as built-in).
    pub fn register_sync(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if let Ok(mut tools) = self.tools.try_write() {
            tools.insert(name.clone(), tool);
            if PROTECTED_TOOL_NAMES.contains(&name.as_str())
                && let Ok(mut builtins) = self.builtin_names.try_write()
            {
                builtins.insert(name.clone());
            }
            tracing::debug!("Registered tool: {}", name);
        }
    }

    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.tools.try_read().map(|t| t.len()).unwrap_or(0)
    }

    /// Definitions of every tool the caller in `ctx` may use, sorted by name.
    pub async fn definitions_for(&self, ctx: &ToolContext) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .await
            .values()
            .filter(|tool| ctx.permits(tool.name(), tool.capabilities()))
            .map(|tool| tool.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run a tool call. Never fails: errors, permission denials and timeouts
    /// come back as an unsuccessful `ToolCallResult`.
    pub async fn dispatch(
        &self,
        name: &str,
        params: serde_json::Value,
        ctx: &ToolContext,
        default_timeout: Duration,
    ) -> ToolCallResult {
        match self.try_dispatch(name, params, ctx, default_timeout).await {
            Ok(value) => ToolCallResult::ok(ToolCallKind::Tool, value),
            Err(e) => {
                tracing::debug!(
                    tenant = %ctx.tenant.tenant_id,
                    tool = name,
                    error = %e,
                    "Tool call failed"
                );
                ToolCallResult::failed(ToolCallKind::Tool, e.to_string())
            }
        }
    }

    async fn try_dispatch(
        &self,
        name: &str,
        params: serde_json::Value,
        ctx: &ToolContext,
        default_timeout: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self.get(name).await.ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        if !ctx.permits(name, tool.capabilities()) {
            return Err(ToolError::NotPermitted {
                name: name.to_string(),
            });
        }
        let limit = tool.execution_timeout().unwrap_or(default_timeout);
        match tokio::time::timeout(limit, tool.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                name: name.to_string(),
                millis: millis(limit),
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
