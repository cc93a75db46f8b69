//! One tenant fetch cycle.
//!
//! For each enabled account, sequentially:
//! 1. Ensure a valid access token (persisting a refreshed credential)
//! 2. List unread messages under the list timeout
//! 3. Skip messages already in the processed ledger
//! 4. Evaluate filters → director triggers
//! 5. Run each triggered director under its own trace
//! 6. Record the message in the ledger, unless a director failed in a
//!    way a later cycle may fix (timeout, transport error)
//!
//! Account and message failures are logged to the tenant's fetch log and
//! never abort the cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::diagnostics::{Diagnostics, LogStream, TraceStatus};
use crate::error::{EngineError, PipelineError, ProviderError};
use crate::mail::{FetchOptions, ProviderRegistry, TokenManager, persist_credential};
use crate::model::{Envelope, LogLevel, MailAccount, ProcessedMessage};
use crate::orchestrator::ConversationEngine;
use crate::pipeline::rules::{CompiledFilters, DirectorTrigger};
use crate::tenant::TenantContext;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Limit on a provider's unread listing.
    pub list_timeout: Duration,
    /// Page size when tenant settings don't override it.
    pub max_messages: usize,
    /// Most recent processed ids kept per tenant.
    pub processed_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            list_timeout: Duration::from_secs(30),
            max_messages: 25,
            processed_capacity: 2000,
        }
    }
}

/// What happened to one account during a cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccountOutcome {
    pub account_id: String,
    /// When this account was last processed.
    pub last_run: Option<DateTime<Utc>>,
    pub fetched: usize,
    /// Messages skipped because they were already processed.
    pub skipped: usize,
    pub triggered: usize,
    /// Director runs that failed.
    pub failed: usize,
    /// Messages left out of the ledger so the next cycle retries them.
    pub deferred: usize,
    /// Set when the account was skipped entirely.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub accounts: Vec<AccountOutcome>,
}

impl CycleReport {
    pub fn triggered(&self) -> usize {
        self.accounts.iter().map(|a| a.triggered).sum()
    }
}

pub struct EmailPipeline {
    tokens: Arc<TokenManager>,
    providers: Arc<ProviderRegistry>,
    engine: Arc<ConversationEngine>,
    diagnostics: Arc<Diagnostics>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

impl EmailPipeline {
    pub fn new(
        tokens: Arc<TokenManager>,
        providers: Arc<ProviderRegistry>,
        engine: Arc<ConversationEngine>,
        diagnostics: Arc<Diagnostics>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            tokens,
            providers,
            engine,
            diagnostics,
            clock,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<ConversationEngine> {
        &self.engine
    }

    /// Run one fetch cycle for the tenant. Only failures to load the
    /// tenant's accounts, settings or filters are returned as errors.
    pub async fn run_cycle(&self, ctx: &TenantContext) -> Result<CycleReport, PipelineError> {
        let started_at = self.clock.now();
        let settings = ctx.bundle.load_settings().await?;
        let accounts: Vec<MailAccount> = ctx
            .bundle
            .accounts
            .get_all()
            .await?
            .into_iter()
            .filter(|a| a.enabled)
            .collect();
        let filters = CompiledFilters::compile(&ctx.bundle.filters.get_all().await?);
        for (filter_id, error) in filters.invalid() {
            self.diagnostics
                .log
                .warn(
                    ctx,
                    LogStream::Fetcher,
                    "invalid_filter",
                    format!("Filter {filter_id} has an invalid pattern"),
                    Some(json!({"filter_id": filter_id, "error": error})),
                )
                .await;
        }

        let options = FetchOptions {
            max: settings
                .fetch_max_messages
                .unwrap_or(self.config.max_messages)
                .max(1),
            unread_only: settings.unread_only,
        };

        let mut outcomes = Vec::with_capacity(accounts.len());
        for account in &accounts {
            outcomes.push(self.process_account(ctx, account, &filters, &options).await);
        }

        let report = CycleReport {
            started_at,
            finished_at: self.clock.now(),
            accounts: outcomes,
        };
        info!(
            tenant = %ctx.tenant_id,
            accounts = report.accounts.len(),
            triggered = report.triggered(),
            "Fetch cycle complete"
        );
        Ok(report)
    }

    async fn process_account(
        &self,
        ctx: &TenantContext,
        account: &MailAccount,
        filters: &CompiledFilters,
        options: &FetchOptions,
    ) -> AccountOutcome {
        let mut outcome = AccountOutcome {
            account_id: account.id.clone(),
            last_run: Some(self.clock.now()),
            ..Default::default()
        };

        let messages = match self.list_messages(ctx, account, options).await {
            Ok(messages) => messages,
            Err(reason) => {
                self.diagnostics
                    .log
                    .warn(
                        ctx,
                        LogStream::Fetcher,
                        "account_skipped",
                        format!("Skipping account {}: {reason}", account.id),
                        Some(json!({"account_id": account.id, "error": reason})),
                    )
                    .await;
                outcome.error = Some(reason);
                return outcome;
            }
        };
        outcome.fetched = messages.len();

        let seen: HashSet<String> = match ctx.bundle.processed_messages.get_all().await {
            Ok(ledger) => ledger
                .into_iter()
                .filter(|p| p.account_id == account.id)
                .map(|p| p.message_id)
                .collect(),
            Err(e) => {
                warn!(tenant = %ctx.tenant_id, account = %account.id, error = %e, "Failed to load processed ledger");
                HashSet::new()
            }
        };

        for envelope in &messages {
            if seen.contains(&envelope.id) {
                outcome.skipped += 1;
                continue;
            }
            let mut retry = false;
            for trigger in filters.director_triggers(envelope) {
                outcome.triggered += 1;
                if let Err(e) = self.trigger_director(ctx, account, envelope, &trigger).await {
                    outcome.failed += 1;
                    retry |= e.is_transient();
                }
            }
            if retry {
                outcome.deferred += 1;
                debug!(tenant = %ctx.tenant_id, message = %envelope.id, "Message deferred to next cycle");
            } else {
                self.mark_processed(ctx, account, envelope).await;
            }
        }

        debug!(
            tenant = %ctx.tenant_id,
            account = %account.id,
            fetched = outcome.fetched,
            skipped = outcome.skipped,
            triggered = outcome.triggered,
            deferred = outcome.deferred,
            "Account processed"
        );
        outcome
    }

    /// Token refresh plus the unread listing. Errors come back as the reason
    /// the account was skipped.
    async fn list_messages(
        &self,
        ctx: &TenantContext,
        account: &MailAccount,
        options: &FetchOptions,
    ) -> Result<Vec<Envelope>, String> {
        let ensured = self
            .tokens
            .ensure_valid(ctx, account)
            .await
            .map_err(|e| e.to_string())?;
        if ensured.updated
            && let Err(e) = persist_credential(ctx, account, &ensured).await
        {
            warn!(tenant = %ctx.tenant_id, account = %account.id, error = %e, "Failed to persist refreshed credential");
        }

        let provider = self
            .providers
            .get(&account.provider)
            .map_err(|e| e.to_string())?;
        let listing = provider.fetch_unread(account, &ensured.access_token, options);
        match tokio::time::timeout(self.config.list_timeout, listing).await {
            Ok(Ok(messages)) => Ok(messages),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(ProviderError::timeout("list_unread", self.config.list_timeout).to_string()),
        }
    }

    /// Run one director for one message under a fresh trace. The failure is
    /// logged here and handed back for the retry decision.
    async fn trigger_director(
        &self,
        ctx: &TenantContext,
        account: &MailAccount,
        envelope: &Envelope,
        trigger: &DirectorTrigger,
    ) -> Result<(), EngineError> {
        let tracer = &self.diagnostics.tracer;
        let trace_id = tracer
            .begin_trace(
                ctx,
                json!({
                    "account_id": account.id,
                    "message_id": envelope.id,
                    "director_id": trigger.director_id,
                    "filter_id": trigger.filter_id,
                    "subject": envelope.subject,
                }),
            )
            .await;

        let result = self
            .engine
            .run_director(ctx, &trigger.director_id, envelope, Some(trace_id.clone()))
            .await;

        match result {
            Ok(outcome) => {
                tracer.end_trace(ctx, &trace_id, TraceStatus::Ok, None).await;
                self.diagnostics
                    .log
                    .record(
                        ctx,
                        LogStream::Fetcher,
                        LogLevel::Info,
                        "director_triggered",
                        format!(
                            "Director {} handled message {}",
                            trigger.director_id, envelope.id
                        ),
                        Some(json!({
                            "account_id": account.id,
                            "filter_id": trigger.filter_id,
                            "thread_id": outcome.thread_id,
                            "trace_id": trace_id,
                        })),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                tracer
                    .end_trace(ctx, &trace_id, TraceStatus::Error, Some(reason.clone()))
                    .await;
                self.diagnostics
                    .log
                    .error(
                        ctx,
                        LogStream::Fetcher,
                        "director_failed",
                        format!(
                            "Director {} failed on message {}: {reason}",
                            trigger.director_id, envelope.id
                        ),
                        Some(json!({
                            "account_id": account.id,
                            "filter_id": trigger.filter_id,
                            "trace_id": trace_id,
                            "retry": e.is_transient(),
                        })),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn mark_processed(&self, ctx: &TenantContext, account: &MailAccount, envelope: &Envelope) {
        let record = ProcessedMessage {
            account_id: account.id.clone(),
            message_id: envelope.id.clone(),
            processed_at: self.clock.now(),
        };
        if let Err(e) = ctx
            .bundle
            .processed_messages
            .append(record, self.config.processed_capacity)
            .await
        {
            warn!(tenant = %ctx.tenant_id, message = %envelope.id, error = %e, "Failed to record processed message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::diagnostics::DiagnosticsConfig;
    use crate::error::LlmError;
    use crate::llm::{
        ChatCompletion, ChatMessage, ChatOptions, LlmCredential, LlmProvider, LlmRegistry,
        MessageRole, TokenUsage,
    };
    use crate::mail::{MailProvider, RefreshedToken};
    use crate::model::{ApiConfig, Credential, Director, Filter, FilterField, Prompt};
    use crate::orchestrator::{EngineConfig, EngineDeps};
    use crate::store::MemoryStore;
    use crate::tenant::{ResourceBundle, TenantId};
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers immediately, or sleeps past any timeout when the email
    /// subject contains "slow". A "flaky" subject stalls only on its first
    /// call.
    struct StubLlm {
        calls: Mutex<usize>,
        flaky_stalled: Mutex<bool>,
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn id(&self) -> &str {
            "stub"
        }

        async fn chat_completion(
            &self,
            _credential: &LlmCredential,
            _model: &str,
            messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<ChatCompletion, LlmError> {
            let slow = messages.iter().any(|m| {
                m.role == MessageRole::User
                    && m.content.as_deref().is_some_and(|c| c.contains("slow"))
            });
            let flaky = messages.iter().any(|m| {
                m.role == MessageRole::User
                    && m.content.as_deref().is_some_and(|c| c.contains("flaky"))
            });
            let stall_once = flaky && !std::mem::replace(&mut *self.flaky_stalled.lock().unwrap(), true);
            if slow || stall_once {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            *self.calls.lock().unwrap() += 1;
            Ok(ChatCompletion {
                assistant_message: ChatMessage::assistant(Some("noted".into()), vec![]),
                tool_calls: vec![],
                usage: TokenUsage::default(),
                raw_request: json!({}),
                raw_response: json!({}),
            })
        }
    }

    /// Serves a fixed inbox per account; listing for "hang" and the token
    /// refresh for "stuck" never return.
    struct StubMail {
        inboxes: HashMap<String, Vec<Envelope>>,
    }

    #[async_trait]
    impl MailProvider for StubMail {
        fn id(&self) -> &str {
            "stub"
        }

        async fn refresh_access_token(
            &self,
            account: &MailAccount,
        ) -> Result<RefreshedToken, ProviderError> {
            if account.id == "stuck" {
                std::future::pending::<()>().await;
            }
            Ok(RefreshedToken {
                access_token: "fresh".into(),
                expires_in_secs: Some(3600),
                refresh_token: None,
            })
        }

        async fn fetch_unread(
            &self,
            account: &MailAccount,
            _access_token: &str,
            options: &FetchOptions,
        ) -> Result<Vec<Envelope>, ProviderError> {
            if account.id == "hang" {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let mut inbox = self.inboxes.get(&account.id).cloned().unwrap_or_default();
            inbox.truncate(options.max);
            Ok(inbox)
        }
    }

    fn envelope(id: &str, subject: &str) -> Envelope {
        Envelope {
            id: id.into(),
            from: "alice@example.com".into(),
            subject: subject.into(),
            ..Default::default()
        }
    }

    fn account(id: &str) -> MailAccount {
        MailAccount::new(id, "stub", format!("{id}@example.com")).with_credential(Credential {
            access_token: None,
            refresh_token: Some("refresh".into()),
            expiry: None,
        })
    }

    struct Fixture {
        pipeline: EmailPipeline,
        llm: Arc<StubLlm>,
        diagnostics: Arc<Diagnostics>,
        ctx: TenantContext,
    }

    async fn fixture(inboxes: HashMap<String, Vec<Envelope>>, accounts: Vec<MailAccount>) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let diagnostics = Arc::new(Diagnostics::new(clock.clone(), &DiagnosticsConfig::default()));
        let llm = Arc::new(StubLlm {
            calls: Mutex::new(0),
            flaky_stalled: Mutex::new(false),
        });
        let engine = ConversationEngine::new(
            EngineDeps::new(
                Arc::new(LlmRegistry::new().with_provider(llm.clone())),
                Arc::new(ToolRegistry::new()),
                diagnostics.clone(),
                clock.clone(),
            ),
            EngineConfig {
                step_timeout: Duration::from_millis(100),
                ..EngineConfig::default()
            },
        );
        let providers = Arc::new(ProviderRegistry::new().with_provider(Arc::new(StubMail { inboxes })));
        let tokens = Arc::new(TokenManager::new(
            providers.clone(),
            clock.clone(),
            diagnostics.clone(),
        ));
        let pipeline = EmailPipeline::new(
            tokens,
            providers,
            Arc::new(engine),
            diagnostics.clone(),
            clock,
            PipelineConfig {
                list_timeout: Duration::from_millis(200),
                ..PipelineConfig::default()
            },
        );

        let bundle = ResourceBundle::new(
            Arc::new(MemoryStore::new()),
            TenantId::parse("t1").unwrap(),
        );
        let ctx = TenantContext::new(Arc::new(bundle));
        let b = &ctx.bundle;
        b.accounts.set_all(&accounts).await.unwrap();
        b.prompts
            .set_all(&[Prompt {
                id: "p".into(),
                name: String::new(),
                content: "triage".into(),
            }])
            .await
            .unwrap();
        b.api_configs
            .set_all(&[ApiConfig {
                id: "api".into(),
                provider: "stub".into(),
                model: "m".into(),
                api_key: String::new(),
                base_url: None,
            }])
            .await
            .unwrap();
        b.directors
            .set_all(&[Director {
                id: "d1".into(),
                name: String::new(),
                prompt_id: "p".into(),
                api_config_id: "api".into(),
                can_spawn_agents: false,
                agent_ids: vec![],
                max_tokens: None,
            }])
            .await
            .unwrap();
        b.filters
            .set_all(&[Filter::new("f1", FilterField::From, "alice", "d1")])
            .await
            .unwrap();

        Fixture {
            pipeline,
            llm,
            diagnostics,
            ctx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_is_contained_per_message() {
        let inboxes = HashMap::from([(
            "acc".to_string(),
            vec![envelope("m1", "slow reply"), envelope("m2", "hello")],
        )]);
        let f = fixture(inboxes, vec![account("acc")]).await;

        let report = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        let outcome = &report.accounts[0];
        assert_eq!(outcome.fetched, 2);
        assert_eq!(outcome.triggered, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.deferred, 1);
        assert_eq!(outcome.last_run, Some(report.started_at));
        assert_eq!(*f.llm.calls.lock().unwrap(), 1);

        let traces = f.ctx.bundle.traces.get_all().await.unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].status, TraceStatus::Error);
        assert_eq!(traces[0].error.as_deref(), Some("engine_step_timeout_100ms"));
        assert_eq!(traces[1].status, TraceStatus::Ok);

        let log = f
            .diagnostics
            .log
            .recent(&f.ctx, LogStream::Fetcher, 10)
            .await
            .unwrap();
        assert!(log.iter().any(|e| e.event == "director_failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn list_timeout_skips_account_and_continues() {
        let inboxes = HashMap::from([("ok".to_string(), vec![envelope("m1", "hello")])]);
        let f = fixture(inboxes, vec![account("hang"), account("ok")]).await;

        let report = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        assert_eq!(report.accounts.len(), 2);
        assert_eq!(
            report.accounts[0].error.as_deref(),
            Some("list_unread_timeout_200ms")
        );
        assert_eq!(report.accounts[1].triggered, 1);
        assert!(report.accounts[1].error.is_none());
    }

    #[tokio::test]
    async fn processed_messages_are_not_retriggered() {
        let inboxes = HashMap::from([("acc".to_string(), vec![envelope("m1", "hello")])]);
        let f = fixture(inboxes, vec![account("acc")]).await;

        let first = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        assert_eq!(first.triggered(), 1);
        let second = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        assert_eq!(second.triggered(), 0);
        assert_eq!(second.accounts[0].skipped, 1);
        assert_eq!(*f.llm.calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_director_is_retried_next_cycle() {
        let inboxes = HashMap::from([("acc".to_string(), vec![envelope("m1", "flaky")])]);
        let f = fixture(inboxes, vec![account("acc")]).await;

        let first = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        assert_eq!(first.accounts[0].failed, 1);
        assert_eq!(first.accounts[0].deferred, 1);
        assert!(f.ctx.bundle.processed_messages.get_all().await.unwrap().is_empty());

        let second = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        assert_eq!(second.accounts[0].skipped, 0);
        assert_eq!(second.accounts[0].triggered, 1);
        assert_eq!(second.accounts[0].failed, 0);
        assert_eq!(*f.llm.calls.lock().unwrap(), 1);

        let third = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        assert_eq!(third.accounts[0].skipped, 1);
        assert_eq!(third.triggered(), 0);
    }

    #[tokio::test]
    async fn permanent_director_failure_is_not_retried() {
        let inboxes = HashMap::from([("acc".to_string(), vec![envelope("m1", "hello")])]);
        let f = fixture(inboxes, vec![account("acc")]).await;
        f.ctx
            .bundle
            .filters
            .set_all(&[Filter::new("f1", FilterField::From, "alice", "missing")])
            .await
            .unwrap();

        let first = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        assert_eq!(first.accounts[0].failed, 1);
        assert_eq!(first.accounts[0].deferred, 0);

        let second = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        assert_eq!(second.accounts[0].skipped, 1);
        assert_eq!(second.triggered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_token_refresh_skips_account() {
        let inboxes = HashMap::from([("acc".to_string(), vec![envelope("m1", "hello")])]);
        let f = fixture(inboxes, vec![account("stuck"), account("acc")]).await;

        let report = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        let stuck = &report.accounts[0];
        assert!(
            stuck
                .error
                .as_deref()
                .unwrap()
                .contains("token_refresh_timeout_30000ms")
        );
        assert!(stuck.last_run.is_some());
        assert_eq!(report.accounts[1].triggered, 1);
    }

    #[tokio::test]
    async fn refreshed_credential_is_persisted() {
        let f = fixture(HashMap::new(), vec![account("acc")]).await;
        f.pipeline.run_cycle(&f.ctx).await.unwrap();
        let stored = f.ctx.bundle.accounts.get_all().await.unwrap();
        assert_eq!(stored[0].credential.access_token.as_deref(), Some("fresh"));
        assert_eq!(stored[0].credential.refresh_token.as_deref(), Some("refresh"));
    }

    #[tokio::test]
    async fn token_failure_skips_account() {
        let mut broken = account("broken");
        broken.credential.refresh_token = None;
        let inboxes = HashMap::from([("acc".to_string(), vec![envelope("m1", "hello")])]);
        let f = fixture(inboxes, vec![broken, account("acc")]).await;

        let report = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        assert!(report.accounts[0].error.is_some());
        assert_eq!(report.accounts[1].triggered, 1);
    }

    #[tokio::test]
    async fn disabled_accounts_are_ignored() {
        let mut disabled = account("acc");
        disabled.enabled = false;
        let f = fixture(HashMap::new(), vec![disabled]).await;
        let report = f.pipeline.run_cycle(&f.ctx).await.unwrap();
        assert!(report.accounts.is_empty());
    }
}
