//! Director, agent, prompt and API configuration records. Read-only from
//! the core; managed elsewhere.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Top-level LLM actor triggered by filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Director {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub prompt_id: String,
    pub api_config_id: String,
    /// Whether this director may delegate to agents.
    #[serde(default)]
    pub can_spawn_agents: bool,
    /// Agents this director may delegate to. Empty means all known agents.
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Director {
    pub fn may_delegate_to(&self, agent_id: &str) -> bool {
        self.can_spawn_agents
            && (self.agent_ids.is_empty() || self.agent_ids.iter().any(|id| id == agent_id))
    }
}

/// Delegated LLM actor that runs the bounded tool loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub prompt_id: String,
    pub api_config_id: String,
    /// Tools this agent may call beyond the mandatory ones. Empty means no
    /// restriction.
    #[serde(default)]
    pub tool_allowlist: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub content: String,
}

/// Which LLM provider and model an actor talks to.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub id: String,
    /// Provider id resolved through the `LlmRegistry` (e.g. "openai").
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
