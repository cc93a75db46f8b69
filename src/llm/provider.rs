//! LLM provider contract and chat message types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::model::ApiConfig;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model. `arguments` is the raw JSON
/// string exactly as the model produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A message in a conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name, for tool result messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Result of a tool call, correlated by `tool_call_id`.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

/// Function-calling schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    None,
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub max_tokens: Option<u32>,
}

impl ChatOptions {
    /// `auto` tool choice when any tool is offered, `none` otherwise.
    pub fn with_tools(tools: Vec<ToolDefinition>, max_tokens: Option<u32>) -> Self {
        let tool_choice = if tools.is_empty() {
            ToolChoice::None
        } else {
            ToolChoice::Auto
        };
        Self {
            tools,
            tool_choice,
            max_tokens,
        }
    }
}

/// Token usage from an LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// One completed chat turn.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub assistant_message: ChatMessage,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub raw_request: serde_json::Value,
    pub raw_response: serde_json::Value,
}

/// Credential used to call a provider.
#[derive(Clone)]
pub struct LlmCredential {
    pub api_key: SecretString,
    pub base_url: Option<String>,
}

impl From<&ApiConfig> for LlmCredential {
    fn from(config: &ApiConfig) -> Self {
        Self {
            api_key: SecretString::from(config.api_key.clone()),
            base_url: config.base_url.clone(),
        }
    }
}

impl fmt::Debug for LlmCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmCredential")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider id matched against `ApiConfig::provider`.
    fn id(&self) -> &str;

    async fn chat_completion(
        &self,
        credential: &LlmCredential,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion, LlmError>;
}

/// LLM providers keyed by provider id.
#[derive(Default, Clone)]
pub struct LlmRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl LlmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        let id = provider.id().to_string();
        tracing::debug!(provider = %id, "Registered LLM provider");
        self.providers.insert(id, provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>, LlmError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| LlmError::UnknownProvider(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_choice_follows_tool_presence() {
        assert_eq!(ChatOptions::with_tools(vec![], None).tool_choice, ToolChoice::None);
        let def = ToolDefinition {
            name: "current_time".into(),
            description: String::new(),
            parameters: serde_json::json!({"type": "object"}),
        };
        assert_eq!(
            ChatOptions::with_tools(vec![def], Some(100)).tool_choice,
            ToolChoice::Auto
        );
    }

    #[test]
    fn message_serialization_skips_empty_fields() {
        let value = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(value, serde_json::json!({"role": "user", "content": "hi"}));
        let tool = ChatMessage::tool_result("call_1", "current_time", "{}");
        let back: ChatMessage =
            serde_json::from_value(serde_json::to_value(&tool).unwrap()).unwrap();
        assert_eq!(back, tool);
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let registry = LlmRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(LlmError::UnknownProvider(id)) if id == "nope"
        ));
    }
}
