//! Director/agent conversation engine.
//!
//! A director turn is a single LLM call over the triggering email. Tool
//! calls it makes are dispatched, and `agent__<id>` calls delegate to an
//! agent, which runs a bounded tool-call loop in its own thread. Every LLM
//! call runs under the step timeout and every tool call under the tool
//! timeout; tool-level failures become tool messages instead of errors.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::diagnostics::{Diagnostics, LogStream, SpanEnd, SpanStart};
use crate::error::{EngineError, millis};
use crate::llm::{
    ChatCompletion, ChatMessage, ChatOptions, LlmCredential, LlmRegistry, ToolCall, ToolDefinition,
};
use crate::model::{
    Agent, ApiConfig, ConversationThread, Director, Envelope, LogLevel, Prompt, ThreadKind,
};
use crate::orchestrator::policy::{DirectorTurn, FinalizationPolicy, FinalizeUnlessDelegated};
use crate::orchestrator::threads;
use crate::tenant::TenantContext;
use crate::tools::{
    AGENT_TOOL_PREFIX, ActorRole, ToolCallKind, ToolCallResult, ToolContext, ToolRegistry,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on agent loop iterations per delegation.
    pub max_agent_steps: usize,
    /// Limit on each LLM call.
    pub step_timeout: Duration,
    /// Default limit on each tool call.
    pub tool_timeout: Duration,
    /// Inactivity window after which a thread expires.
    pub thread_ttl: chrono::Duration,
    pub default_max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_agent_steps: 6,
            step_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(20),
            thread_ttl: chrono::Duration::hours(24),
            default_max_tokens: 1024,
        }
    }
}

/// Core dependencies for the engine.
pub struct EngineDeps {
    pub llm: Arc<LlmRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub diagnostics: Arc<Diagnostics>,
    pub clock: Arc<dyn Clock>,
    pub policy: Arc<dyn FinalizationPolicy>,
}

impl EngineDeps {
    pub fn new(
        llm: Arc<LlmRegistry>,
        tools: Arc<ToolRegistry>,
        diagnostics: Arc<Diagnostics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            llm,
            tools,
            diagnostics,
            clock,
            policy: Arc::new(FinalizeUnlessDelegated),
        }
    }
}

/// Result of one agent loop.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRun {
    pub agent_id: String,
    pub thread_id: String,
    pub reused_thread: bool,
    pub steps: usize,
    /// The model stopped calling tools before the step cap.
    pub completed: bool,
    pub last_reply: Option<String>,
}

/// Result of one director turn.
#[derive(Debug, Clone, Serialize)]
pub struct DirectorOutcome {
    pub thread_id: String,
    pub finalized: bool,
    pub reply: Option<String>,
    pub tool_results: Vec<ToolCallResult>,
    pub agent_runs: Vec<AgentRun>,
}

/// Result of one agent step.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStep {
    pub tool_calls: usize,
    pub reply: Option<String>,
}

/// Result of `run_step` on an existing thread.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StepOutcome {
    Director(DirectorOutcome),
    Agent(AgentStep),
}

pub struct ConversationEngine {
    deps: EngineDeps,
    config: EngineConfig,
}

/// Director-side resolved records.
struct DirectorSetup {
    director: Director,
    api: ApiConfig,
}

/// Agent-side resolved records.
struct AgentSetup {
    agent: Agent,
    prompt: Prompt,
    api: ApiConfig,
}

fn agent_tool_name(agent_id: &str) -> String {
    format!("{AGENT_TOOL_PREFIX}{agent_id}")
}

fn agent_tool_definition(agent: &Agent) -> ToolDefinition {
    let label = if agent.name.is_empty() {
        agent.id.as_str()
    } else {
        agent.name.as_str()
    };
    ToolDefinition {
        name: agent_tool_name(&agent.id),
        description: format!(
            "Delegate a task to the '{label}' agent. Describe what it should do in `input`."
        ),
        parameters: json!({
            "type": "object",
            "properties": {
                "input": {
                    "type": "string",
                    "description": "Instruction for the agent"
                }
            },
            "required": ["input"]
        }),
    }
}

/// Parse model-produced tool arguments. An empty string means `{}`.
fn parse_arguments(call: &ToolCall) -> Result<Value, String> {
    let raw = call.arguments.trim();
    if raw.is_empty() {
        return Ok(json!({}));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(format!(
            "invalid_arguments: arguments for {} must be a JSON object",
            call.name
        )),
        Err(e) => Err(format!("invalid_arguments: {} ({e})", call.name)),
    }
}

impl ConversationEngine {
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        Self { deps, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn load_director(
        &self,
        ctx: &TenantContext,
        director_id: &str,
    ) -> Result<DirectorSetup, EngineError> {
        let director = ctx
            .bundle
            .directors
            .get_all()
            .await?
            .into_iter()
            .find(|d| d.id == director_id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "director",
                id: director_id.to_string(),
            })?;
        let api = self.load_api_config(ctx, &director.api_config_id).await?;
        Ok(DirectorSetup { director, api })
    }

    async fn load_agent(&self, ctx: &TenantContext, agent_id: &str) -> Result<AgentSetup, EngineError> {
        let agent = ctx
            .bundle
            .agents
            .get_all()
            .await?
            .into_iter()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "agent",
                id: agent_id.to_string(),
            })?;
        let prompt = self.load_prompt(ctx, &agent.prompt_id).await?;
        let api = self.load_api_config(ctx, &agent.api_config_id).await?;
        Ok(AgentSetup { agent, prompt, api })
    }

    async fn load_prompt(&self, ctx: &TenantContext, prompt_id: &str) -> Result<Prompt, EngineError> {
        ctx.bundle
            .prompts
            .get_all()
            .await?
            .into_iter()
            .find(|p| p.id == prompt_id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "prompt",
                id: prompt_id.to_string(),
            })
    }

    async fn load_api_config(&self, ctx: &TenantContext, id: &str) -> Result<ApiConfig, EngineError> {
        ctx.bundle
            .api_configs
            .get_all()
            .await?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "api_config",
                id: id.to_string(),
            })
    }

    /// One LLM call under the step timeout, recorded as a span.
    async fn call_llm(
        &self,
        ctx: &TenantContext,
        trace_id: Option<&str>,
        span_name: String,
        api: &ApiConfig,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion, EngineError> {
        let provider = self.deps.llm.get(&api.provider)?;
        let credential = LlmCredential::from(api);
        let tracer = &self.deps.diagnostics.tracer;

        let span = match trace_id {
            Some(trace_id) => {
                let start = SpanStart::new("llm", span_name).with_request(json!({
                    "provider": api.provider,
                    "model": api.model,
                    "messages": messages,
                    "tools": options.tools.iter().map(|t| &t.name).collect::<Vec<_>>(),
                }));
                tracer
                    .begin_span(ctx, trace_id, start)
                    .await
                    .map(|span_id| (trace_id, span_id))
            }
            None => None,
        };

        let call = provider.chat_completion(&credential, &api.model, messages, options);
        let result = match tokio::time::timeout(self.config.step_timeout, call).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(e)) => Err(EngineError::Llm(e)),
            Err(_) => Err(EngineError::StepTimeout {
                millis: millis(self.config.step_timeout),
            }),
        };

        if let Some((trace_id, span_id)) = span {
            let end = match &result {
                Ok(completion) => SpanEnd::ok(Some(json!({
                    "response": completion.raw_response,
                    "usage": completion.usage,
                }))),
                Err(e) => SpanEnd::error(e.to_string()),
            };
            tracer.end_span(ctx, trace_id, &span_id, end).await;
        }
        result
    }

    /// Dispatch a regular tool call, recorded as a span.
    async fn call_tool(&self, tool_ctx: &ToolContext, call: &ToolCall) -> ToolCallResult {
        let params = match parse_arguments(call) {
            Ok(params) => params,
            Err(reason) => return ToolCallResult::failed(ToolCallKind::Tool, reason),
        };
        let tracer = &self.deps.diagnostics.tracer;
        let span = match tool_ctx.trace_id.as_deref() {
            Some(trace_id) => tracer
                .begin_span(
                    &tool_ctx.tenant,
                    trace_id,
                    SpanStart::new("tool", call.name.clone()).with_request(params.clone()),
                )
                .await
                .map(|span_id| (trace_id, span_id)),
            None => None,
        };

        let result = self
            .deps
            .tools
            .dispatch(&call.name, params, tool_ctx, self.config.tool_timeout)
            .await;

        if let Some((trace_id, span_id)) = span {
            let end = if result.success {
                SpanEnd::ok(Some(result.result.clone()))
            } else {
                SpanEnd::error(result.error.clone().unwrap_or_default())
            };
            tracer.end_span(&tool_ctx.tenant, trace_id, &span_id, end).await;
        }
        result
    }

    async fn director_tools(
        &self,
        ctx: &TenantContext,
        director: &Director,
        tool_ctx: &ToolContext,
    ) -> Result<Vec<ToolDefinition>, EngineError> {
        let mut defs = self.deps.tools.definitions_for(tool_ctx).await;
        if director.can_spawn_agents {
            let agents = ctx.bundle.agents.get_all().await?;
            defs.extend(
                agents
                    .iter()
                    .filter(|a| director.may_delegate_to(&a.id))
                    .map(agent_tool_definition),
            );
        }
        Ok(defs)
    }

    /// Start a director thread for `email` and run its first turn.
    pub async fn run_director(
        &self,
        ctx: &TenantContext,
        director_id: &str,
        email: &Envelope,
        trace_id: Option<String>,
    ) -> Result<DirectorOutcome, EngineError> {
        let setup = self.load_director(ctx, director_id).await?;
        let prompt = self.load_prompt(ctx, &setup.director.prompt_id).await?;
        let now = self.deps.clock.now();
        let thread = ConversationThread::new_director(
            director_id,
            trace_id,
            Some(email.clone()),
            vec![
                ChatMessage::system(prompt.content),
                ChatMessage::user(email.render_for_prompt()),
            ],
            now,
            self.config.thread_ttl,
        );
        threads::insert(ctx, thread.clone()).await?;
        info!(
            tenant = %ctx.tenant_id,
            director = director_id,
            thread = %thread.id,
            message = %email.id,
            "Director thread started"
        );
        self.director_turn(ctx, &setup, thread).await
    }

    async fn director_turn(
        &self,
        ctx: &TenantContext,
        setup: &DirectorSetup,
        thread: ConversationThread,
    ) -> Result<DirectorOutcome, EngineError> {
        thread.ensure_writable(self.deps.clock.now())?;
        let director = &setup.director;
        let trace_id = thread.trace_id.as_deref();
        let tool_ctx = ToolContext {
            tenant: ctx.clone(),
            role: ActorRole::Director,
            actor_id: director.id.clone(),
            thread_id: thread.id.clone(),
            trace_id: thread.trace_id.clone(),
            allowlist: Vec::new(),
        };
        let tools = self.director_tools(ctx, director, &tool_ctx).await?;
        let options = ChatOptions::with_tools(
            tools,
            Some(director.max_tokens.unwrap_or(self.config.default_max_tokens)),
        );

        let completion = self
            .call_llm(
                ctx,
                trace_id,
                format!("director:{}", director.id),
                &setup.api,
                &thread.messages,
                &options,
            )
            .await?;
        let reply = completion.assistant_message.content.clone();
        threads::append(
            ctx,
            &thread.id,
            vec![completion.assistant_message],
            self.deps.clock.now(),
            self.config.thread_ttl,
        )
        .await?;

        let mut tool_results = Vec::new();
        let mut agent_runs = Vec::new();
        let mut delegations = 0;
        for call in &completion.tool_calls {
            let result = match call.name.strip_prefix(AGENT_TOOL_PREFIX) {
                Some(agent_id) => {
                    delegations += 1;
                    let result = self.delegate_call(ctx, director, &thread, agent_id, call).await;
                    if let Ok(run) = &result {
                        agent_runs.push(run.clone());
                    }
                    match result {
                        Ok(run) => ToolCallResult::ok(
                            ToolCallKind::Agent,
                            json!({
                                "agent_id": run.agent_id,
                                "thread_id": run.thread_id,
                                "steps": run.steps,
                                "completed": run.completed,
                                "reply": run.last_reply,
                            }),
                        ),
                        Err(reason) => ToolCallResult::failed(ToolCallKind::Agent, reason),
                    }
                }
                None => self.call_tool(&tool_ctx, call).await,
            };
            threads::append(
                ctx,
                &thread.id,
                vec![ChatMessage::tool_result(
                    &call.id,
                    &call.name,
                    result.to_content(),
                )],
                self.deps.clock.now(),
                self.config.thread_ttl,
            )
            .await?;
            tool_results.push(result);
        }

        let turn = DirectorTurn {
            tool_calls: completion.tool_calls.len(),
            delegations,
            has_text: reply.as_deref().is_some_and(|r| !r.trim().is_empty()),
        };
        let finalized = self.deps.policy.should_finalize(&turn);
        if finalized {
            threads::finalize(ctx, &thread.id, self.deps.clock.now()).await?;
        }

        self.deps
            .diagnostics
            .log
            .record(
                ctx,
                LogStream::Orchestration,
                LogLevel::Info,
                "director_step",
                format!("Director {} completed a turn", director.id),
                Some(json!({
                    "thread_id": thread.id,
                    "tool_calls": turn.tool_calls,
                    "delegations": delegations,
                    "finalized": finalized,
                })),
            )
            .await;

        Ok(DirectorOutcome {
            thread_id: thread.id,
            finalized,
            reply,
            tool_results,
            agent_runs,
        })
    }

    /// Handle an `agent__<id>` call. Failures are returned as a reason
    /// string for the tool message.
    async fn delegate_call(
        &self,
        ctx: &TenantContext,
        director: &Director,
        parent: &ConversationThread,
        agent_id: &str,
        call: &ToolCall,
    ) -> Result<AgentRun, String> {
        if !director.may_delegate_to(agent_id) {
            return Err(format!(
                "delegation_not_permitted: director {} may not delegate to {agent_id}",
                director.id
            ));
        }
        let params = parse_arguments(call)?;
        let input = params
            .get("input")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| format!("invalid_arguments: {} requires a string 'input'", call.name))?;

        let tracer = &self.deps.diagnostics.tracer;
        let span = match parent.trace_id.as_deref() {
            Some(trace_id) => tracer
                .begin_span(
                    ctx,
                    trace_id,
                    SpanStart::new("agent", agent_id).with_request(json!({"input": input})),
                )
                .await
                .map(|span_id| (trace_id, span_id)),
            None => None,
        };

        let result = self.delegate(ctx, parent, agent_id, input).await;

        if let Some((trace_id, span_id)) = span {
            let end = match &result {
                Ok(run) => SpanEnd::ok(Some(json!({
                    "thread_id": run.thread_id,
                    "steps": run.steps,
                    "completed": run.completed,
                }))),
                Err(e) => SpanEnd::error(e.to_string()),
            };
            tracer.end_span(ctx, trace_id, &span_id, end).await;
        }

        result.map_err(|e| {
            warn!(
                tenant = %ctx.tenant_id,
                agent = agent_id,
                error = %e,
                "Agent delegation failed"
            );
            e.to_string()
        })
    }

    /// Reuse or open the agent thread under `parent` and run the agent loop.
    pub async fn delegate(
        &self,
        ctx: &TenantContext,
        parent: &ConversationThread,
        agent_id: &str,
        instruction: &str,
    ) -> Result<AgentRun, EngineError> {
        let setup = self.load_agent(ctx, agent_id).await?;
        let (thread, reused) = threads::open_agent_thread(
            ctx,
            parent,
            agent_id,
            &setup.prompt.content,
            instruction,
            self.deps.clock.now(),
            self.config.thread_ttl,
        )
        .await?;
        debug!(
            tenant = %ctx.tenant_id,
            agent = agent_id,
            thread = %thread.id,
            reused,
            "Delegating to agent"
        );
        let mut run = self.agent_loop(ctx, &setup, &thread.id).await?;
        run.reused_thread = reused;
        Ok(run)
    }

    /// Run the bounded tool-call loop on an agent thread.
    pub async fn run_agent_loop(
        &self,
        ctx: &TenantContext,
        agent_id: &str,
        thread_id: &str,
    ) -> Result<AgentRun, EngineError> {
        let setup = self.load_agent(ctx, agent_id).await?;
        self.agent_loop(ctx, &setup, thread_id).await
    }

    async fn agent_loop(
        &self,
        ctx: &TenantContext,
        setup: &AgentSetup,
        thread_id: &str,
    ) -> Result<AgentRun, EngineError> {
        let mut steps = 0;
        let mut completed = false;
        let mut last_reply = None;
        while steps < self.config.max_agent_steps {
            steps += 1;
            let step = self.agent_step_with(ctx, setup, thread_id).await?;
            if step.reply.is_some() {
                last_reply = step.reply;
            }
            if step.tool_calls == 0 {
                completed = true;
                break;
            }
        }
        if !completed {
            self.deps
                .diagnostics
                .log
                .record(
                    ctx,
                    LogStream::Orchestration,
                    LogLevel::Info,
                    "agent_step_cap",
                    format!(
                        "Agent {} stopped after {steps} steps",
                        setup.agent.id
                    ),
                    Some(json!({"thread_id": thread_id})),
                )
                .await;
        }
        Ok(AgentRun {
            agent_id: setup.agent.id.clone(),
            thread_id: thread_id.to_string(),
            reused_thread: false,
            steps,
            completed,
            last_reply,
        })
    }

    /// One agent step: an LLM call, then every requested tool call.
    pub async fn agent_step(
        &self,
        ctx: &TenantContext,
        agent_id: &str,
        thread_id: &str,
    ) -> Result<AgentStep, EngineError> {
        let setup = self.load_agent(ctx, agent_id).await?;
        self.agent_step_with(ctx, &setup, thread_id).await
    }

    async fn agent_step_with(
        &self,
        ctx: &TenantContext,
        setup: &AgentSetup,
        thread_id: &str,
    ) -> Result<AgentStep, EngineError> {
        let thread = threads::get(ctx, thread_id).await?;
        thread.ensure_writable(self.deps.clock.now())?;
        let agent = &setup.agent;
        let tool_ctx = ToolContext {
            tenant: ctx.clone(),
            role: ActorRole::Agent,
            actor_id: agent.id.clone(),
            thread_id: thread.id.clone(),
            trace_id: thread.trace_id.clone(),
            allowlist: agent.tool_allowlist.clone(),
        };
        let tools = self.deps.tools.definitions_for(&tool_ctx).await;
        let options = ChatOptions::with_tools(
            tools,
            Some(agent.max_tokens.unwrap_or(self.config.default_max_tokens)),
        );

        let completion = self
            .call_llm(
                ctx,
                thread.trace_id.as_deref(),
                format!("agent:{}", agent.id),
                &setup.api,
                &thread.messages,
                &options,
            )
            .await?;
        let reply = completion.assistant_message.content.clone();
        threads::append(
            ctx,
            &thread.id,
            vec![completion.assistant_message],
            self.deps.clock.now(),
            self.config.thread_ttl,
        )
        .await?;

        for call in &completion.tool_calls {
            let result = if call.name.starts_with(AGENT_TOOL_PREFIX) {
                ToolCallResult::failed(
                    ToolCallKind::Tool,
                    format!("Tool {} is not available to this actor", call.name),
                )
            } else {
                self.call_tool(&tool_ctx, call).await
            };
            threads::append(
                ctx,
                &thread.id,
                vec![ChatMessage::tool_result(
                    &call.id,
                    &call.name,
                    result.to_content(),
                )],
                self.deps.clock.now(),
                self.config.thread_ttl,
            )
            .await?;
        }

        Ok(AgentStep {
            tool_calls: completion.tool_calls.len(),
            reply,
        })
    }

    /// Run one engine step on an existing thread of either kind.
    pub async fn run_step(
        &self,
        ctx: &TenantContext,
        thread_id: &str,
    ) -> Result<StepOutcome, EngineError> {
        let thread = threads::get(ctx, thread_id).await?;
        thread.ensure_writable(self.deps.clock.now())?;
        match thread.kind {
            ThreadKind::Director => {
                let setup = self.load_director(ctx, &thread.director_id).await?;
                Ok(StepOutcome::Director(
                    self.director_turn(ctx, &setup, thread).await?,
                ))
            }
            ThreadKind::Agent => {
                let agent_id = thread.agent_id.clone().unwrap_or_default();
                let setup = self.load_agent(ctx, &agent_id).await?;
                Ok(StepOutcome::Agent(
                    self.agent_step_with(ctx, &setup, &thread.id).await?,
                ))
            }
        }
    }

    pub async fn finalize_thread(
        &self,
        ctx: &TenantContext,
        thread_id: &str,
    ) -> Result<ConversationThread, EngineError> {
        threads::finalize(ctx, thread_id, self.deps.clock.now()).await
    }

    pub async fn get_thread(
        &self,
        ctx: &TenantContext,
        thread_id: &str,
    ) -> Result<ConversationThread, EngineError> {
        threads::get(ctx, thread_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::diagnostics::DiagnosticsConfig;
    use crate::error::{ConversationError, LlmError};
    use crate::llm::{LlmProvider, MessageRole, TokenUsage};
    use crate::store::MemoryStore;
    use crate::tenant::{ResourceBundle, TenantId};
    use crate::tools::builtin::register_builtins;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies from a script keyed by the system prompt of the conversation;
    /// falls back to `fallback` once a script runs dry.
    struct ScriptedLlm {
        scripts: Mutex<Vec<(String, VecDeque<ChatMessage>)>>,
        fallback: ChatMessage,
        calls: Mutex<Vec<(String, Vec<String>)>>,
        delay: Option<Duration>,
    }

    impl ScriptedLlm {
        fn new(fallback: ChatMessage) -> Self {
            Self {
                scripts: Mutex::new(Vec::new()),
                fallback,
                calls: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn script(self, system_prompt: &str, replies: Vec<ChatMessage>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .push((system_prompt.to_string(), replies.into()));
            self
        }

        fn calls_for(&self, system_prompt: &str) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(prompt, _)| prompt == system_prompt)
                .map(|(_, tools)| tools.clone())
                .collect()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn chat_completion(
            &self,
            _credential: &LlmCredential,
            _model: &str,
            messages: &[ChatMessage],
            options: &ChatOptions,
        ) -> Result<ChatCompletion, LlmError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let system = messages
                .iter()
                .find(|m| m.role == MessageRole::System)
                .and_then(|m| m.content.clone())
                .unwrap_or_default();
            self.calls.lock().unwrap().push((
                system.clone(),
                options.tools.iter().map(|t| t.name.clone()).collect(),
            ));
            let reply = self
                .scripts
                .lock()
                .unwrap()
                .iter_mut()
                .find(|(prompt, _)| *prompt == system)
                .and_then(|(_, replies)| replies.pop_front())
                .unwrap_or_else(|| self.fallback.clone());
            Ok(ChatCompletion {
                tool_calls: reply.tool_calls.clone(),
                assistant_message: reply,
                usage: TokenUsage::default(),
                raw_request: json!({}),
                raw_response: json!({}),
            })
        }
    }

    fn call(id: &str, name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    fn tool_reply(calls: Vec<ToolCall>) -> ChatMessage {
        ChatMessage::assistant(None, calls)
    }

    fn text_reply(text: &str) -> ChatMessage {
        ChatMessage::assistant(Some(text.into()), vec![])
    }

    struct Fixture {
        engine: ConversationEngine,
        llm: Arc<ScriptedLlm>,
        clock: Arc<ManualClock>,
        ctx: TenantContext,
    }

    async fn fixture(llm: ScriptedLlm, config: EngineConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let llm = Arc::new(llm);
        let diagnostics = Arc::new(Diagnostics::new(clock.clone(), &DiagnosticsConfig::default()));
        let tools = Arc::new(ToolRegistry::new());
        register_builtins(&tools, clock.clone(), diagnostics.clone());
        let deps = EngineDeps::new(
            Arc::new(LlmRegistry::new().with_provider(llm.clone())),
            tools,
            diagnostics,
            clock.clone(),
        );
        let bundle = ResourceBundle::new(
            Arc::new(MemoryStore::new()),
            TenantId::parse("t1").unwrap(),
        );
        let ctx = TenantContext::new(Arc::new(bundle));
        seed(&ctx).await;
        Fixture {
            engine: ConversationEngine::new(deps, config),
            llm,
            clock,
            ctx,
        }
    }

    async fn seed(ctx: &TenantContext) {
        let b = &ctx.bundle;
        b.prompts
            .set_all(&[
                Prompt {
                    id: "p-dir".into(),
                    name: String::new(),
                    content: "DIRECTOR".into(),
                },
                Prompt {
                    id: "p-agent".into(),
                    name: String::new(),
                    content: "AGENT".into(),
                },
            ])
            .await
            .unwrap();
        b.api_configs
            .set_all(&[ApiConfig {
                id: "api".into(),
                provider: "scripted".into(),
                model: "m".into(),
                api_key: "k".into(),
                base_url: None,
            }])
            .await
            .unwrap();
        b.directors
            .set_all(&[Director {
                id: "d1".into(),
                name: "Triage".into(),
                prompt_id: "p-dir".into(),
                api_config_id: "api".into(),
                can_spawn_agents: true,
                agent_ids: vec![],
                max_tokens: None,
            }])
            .await
            .unwrap();
        b.agents
            .set_all(&[Agent {
                id: "a1".into(),
                name: "Researcher".into(),
                prompt_id: "p-agent".into(),
                api_config_id: "api".into(),
                tool_allowlist: vec![],
                max_tokens: None,
            }])
            .await
            .unwrap();
    }

    fn email() -> Envelope {
        Envelope {
            id: "m1".into(),
            from: "alice@example.com".into(),
            subject: "Invoice".into(),
            body: "Please pay".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn director_without_tool_calls_finalizes() {
        let f = fixture(ScriptedLlm::new(text_reply("done")), EngineConfig::default()).await;
        let outcome = f
            .engine
            .run_director(&f.ctx, "d1", &email(), None)
            .await
            .unwrap();
        assert!(outcome.finalized);
        assert_eq!(outcome.reply.as_deref(), Some("done"));

        let thread = f.engine.get_thread(&f.ctx, &outcome.thread_id).await.unwrap();
        assert_eq!(thread.kind, ThreadKind::Director);
        assert_eq!(thread.messages.len(), 3);
        assert!(thread.messages[1].content.as_deref().unwrap().contains("Subject: Invoice"));

        // Director sees builtins and the agent delegation tool.
        let calls = f.llm.calls_for("DIRECTOR");
        assert_eq!(
            calls[0],
            vec!["current_time", "list_filters", "log_note", "agent__a1"]
        );
    }

    #[tokio::test]
    async fn agent_loop_stops_at_step_cap() {
        let llm = ScriptedLlm::new(tool_reply(vec![call("c", "current_time", "{}")])).script(
            "DIRECTOR",
            vec![tool_reply(vec![call(
                "d",
                "agent__a1",
                r#"{"input": "look this up"}"#,
            )])],
        );
        let f = fixture(llm, EngineConfig::default()).await;
        let outcome = f
            .engine
            .run_director(&f.ctx, "d1", &email(), None)
            .await
            .unwrap();

        assert!(!outcome.finalized);
        let run = &outcome.agent_runs[0];
        assert_eq!(run.steps, 6);
        assert!(!run.completed);
        assert_eq!(f.llm.calls_for("AGENT").len(), 6);

        let thread = f.engine.get_thread(&f.ctx, &run.thread_id).await.unwrap();
        // system + instruction + 6 × (assistant + tool result)
        assert_eq!(thread.messages.len(), 2 + 12);
    }

    #[tokio::test]
    async fn agent_tools_exclude_director_only_and_spawn_tools() {
        let llm = ScriptedLlm::new(text_reply("ok")).script(
            "DIRECTOR",
            vec![tool_reply(vec![call("d", "agent__a1", r#"{"input": "go"}"#)])],
        );
        let f = fixture(llm, EngineConfig::default()).await;
        f.engine
            .run_director(&f.ctx, "d1", &email(), None)
            .await
            .unwrap();
        let agent_calls = f.llm.calls_for("AGENT");
        assert_eq!(agent_calls.len(), 1);
        assert_eq!(agent_calls[0], vec!["current_time", "log_note"]);
    }

    #[tokio::test]
    async fn delegation_reuses_ongoing_agent_thread() {
        let llm = ScriptedLlm::new(text_reply("ok"));
        let f = fixture(llm, EngineConfig::default()).await;
        let parent = ConversationThread::new_director(
            "d1",
            None,
            None,
            vec![],
            f.clock.now(),
            f.engine.config().thread_ttl,
        );
        threads::insert(&f.ctx, parent.clone()).await.unwrap();

        let first = f.engine.delegate(&f.ctx, &parent, "a1", "one").await.unwrap();
        let second = f.engine.delegate(&f.ctx, &parent, "a1", "two").await.unwrap();
        assert!(!first.reused_thread);
        assert!(second.reused_thread);
        assert_eq!(first.thread_id, second.thread_id);

        f.engine
            .finalize_thread(&f.ctx, &first.thread_id)
            .await
            .unwrap();
        let third = f.engine.delegate(&f.ctx, &parent, "a1", "three").await.unwrap();
        assert!(!third.reused_thread);
        assert_ne!(third.thread_id, first.thread_id);
    }

    #[tokio::test]
    async fn expired_agent_thread_is_not_reused() {
        let f = fixture(ScriptedLlm::new(text_reply("ok")), EngineConfig::default()).await;
        let parent = ConversationThread::new_director(
            "d1",
            None,
            None,
            vec![],
            f.clock.now(),
            chrono::Duration::days(30),
        );
        threads::insert(&f.ctx, parent.clone()).await.unwrap();
        let first = f.engine.delegate(&f.ctx, &parent, "a1", "one").await.unwrap();
        f.clock.advance(chrono::Duration::hours(25));
        let second = f.engine.delegate(&f.ctx, &parent, "a1", "two").await.unwrap();
        assert_ne!(first.thread_id, second.thread_id);
    }

    #[tokio::test]
    async fn bad_arguments_become_tool_messages() {
        let llm = ScriptedLlm::new(text_reply("ok")).script(
            "AGENT",
            vec![
                tool_reply(vec![
                    call("c1", "current_time", "{not json"),
                    call("c2", "no_such_tool", "{}"),
                ]),
                text_reply("finished"),
            ],
        );
        let f = fixture(llm, EngineConfig::default()).await;
        let parent = ConversationThread::new_director(
            "d1",
            None,
            None,
            vec![],
            f.clock.now(),
            f.engine.config().thread_ttl,
        );
        threads::insert(&f.ctx, parent.clone()).await.unwrap();

        let run = f.engine.delegate(&f.ctx, &parent, "a1", "go").await.unwrap();
        assert!(run.completed);
        assert_eq!(run.steps, 2);
        assert_eq!(run.last_reply.as_deref(), Some("finished"));

        let thread = f.engine.get_thread(&f.ctx, &run.thread_id).await.unwrap();
        let tool_messages: Vec<_> = thread
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .collect();
        assert_eq!(tool_messages.len(), 2);
        assert!(tool_messages[0].content.as_deref().unwrap().contains("invalid_arguments"));
        assert!(tool_messages[1].content.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_surfaces_as_engine_error() {
        let mut llm = ScriptedLlm::new(text_reply("late"));
        llm.delay = Some(Duration::from_secs(120));
        let config = EngineConfig {
            step_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        };
        let f = fixture(llm, config).await;
        let err = f
            .engine
            .run_director(&f.ctx, "d1", &email(), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "engine_step_timeout_500ms");
    }

    #[tokio::test]
    async fn run_step_rejects_finalized_thread() {
        let f = fixture(ScriptedLlm::new(text_reply("done")), EngineConfig::default()).await;
        let outcome = f
            .engine
            .run_director(&f.ctx, "d1", &email(), None)
            .await
            .unwrap();
        let err = f
            .engine
            .run_step(&f.ctx, &outcome.thread_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Conversation(ConversationError::Finalized { .. })
        ));
    }

    #[tokio::test]
    async fn run_step_continues_open_director_thread() {
        let llm = ScriptedLlm::new(text_reply("wrapped up")).script(
            "DIRECTOR",
            vec![tool_reply(vec![call("d", "agent__a1", r#"{"input": "go"}"#)])],
        );
        let f = fixture(llm, EngineConfig::default()).await;
        let first = f
            .engine
            .run_director(&f.ctx, "d1", &email(), None)
            .await
            .unwrap();
        assert!(!first.finalized);

        match f.engine.run_step(&f.ctx, &first.thread_id).await.unwrap() {
            StepOutcome::Director(outcome) => {
                assert!(outcome.finalized);
                assert_eq!(outcome.reply.as_deref(), Some("wrapped up"));
            }
            StepOutcome::Agent(_) => panic!("expected a director step"),
        }
    }

    #[tokio::test]
    async fn unknown_director_is_not_found() {
        let f = fixture(ScriptedLlm::new(text_reply("x")), EngineConfig::default()).await;
        let err = f
            .engine
            .run_director(&f.ctx, "nope", &email(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "director", .. }));
    }

    #[tokio::test]
    async fn delegation_to_forbidden_agent_is_contained() {
        let llm = ScriptedLlm::new(text_reply("ok")).script(
            "DIRECTOR",
            vec![tool_reply(vec![call("d", "agent__ghost", r#"{"input": "go"}"#)])],
        );
        let f = fixture(llm, EngineConfig::default()).await;
        let outcome = f
            .engine
            .run_director(&f.ctx, "d1", &email(), None)
            .await
            .unwrap();
        assert!(outcome.agent_runs.is_empty());
        assert!(!outcome.tool_results[0].success);
        assert!(f.llm.calls_for("AGENT").is_empty());
    }
}
