//! OpenAI-compatible chat completions provider.
//!
//! Works with any endpoint speaking the `/chat/completions` function-calling
//! dialect (OpenAI, Groq, Together, vLLM, Ollama, ...).

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatCompletion, ChatMessage, ChatOptions, LlmCredential, LlmProvider, MessageRole, TokenUsage,
    ToolCall, ToolChoice,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatibleProvider {
    id: String,
    client: reqwest::Client,
    default_base_url: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            id: "openai".to_string(),
            client,
            default_base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Register under a different provider id (e.g. "groq").
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Base URL used when the credential carries none.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.default_base_url = base_url.into();
        self
    }

    fn endpoint(&self, credential: &LlmCredential) -> String {
        let base = credential
            .base_url
            .as_deref()
            .filter(|b| !b.is_empty())
            .unwrap_or(&self.default_base_url);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    fn request_failed(&self, reason: impl Into<String>) -> LlmError {
        LlmError::RequestFailed {
            provider: self.id.clone(),
            reason: reason.into(),
        }
    }

    fn invalid_response(&self, reason: impl Into<String>) -> LlmError {
        LlmError::InvalidResponse {
            provider: self.id.clone(),
            reason: reason.into(),
        }
    }
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let mut out = json!({
        "role": role_name(message.role),
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        out["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments},
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    if let Some(name) = &message.name {
        out["name"] = json!(name);
    }
    out
}

/// Build the request body. Tools are only sent when some are offered.
pub fn build_request(model: &str, messages: &[ChatMessage], options: &ChatOptions) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
    });
    if !options.tools.is_empty() {
        body["tools"] = options
            .tools
            .iter()
            .map(|def| {
                json!({
                    "type": "function",
                    "function": {
                        "name": def.name,
                        "description": def.description,
                        "parameters": def.parameters,
                    }
                })
            })
            .collect();
    }
    body["tool_choice"] = json!(match options.tool_choice {
        ToolChoice::Auto if !options.tools.is_empty() => "auto",
        _ => "none",
    });
    if let Some(max_tokens) = options.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat_completion(
        &self,
        credential: &LlmCredential,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion, LlmError> {
        let raw_request = build_request(model, messages, options);
        let url = self.endpoint(credential);

        let mut request = self.client.post(&url).json(&raw_request);
        let key = credential.api_key.expose_secret();
        if !key.is_empty() {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.request_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                provider: self.id.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let raw_response: Value = response
            .json()
            .await
            .map_err(|e| self.invalid_response(e.to_string()))?;
        let parsed: WireResponse = serde_json::from_value(raw_response.clone())?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.invalid_response("no choices in response"))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        tracing::debug!(
            provider = %self.id,
            model,
            tool_calls = tool_calls.len(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Chat completion finished"
        );

        Ok(ChatCompletion {
            assistant_message: ChatMessage::assistant(choice.message.content, tool_calls.clone()),
            tool_calls,
            usage,
            raw_request,
            raw_response,
        })
    }
}
