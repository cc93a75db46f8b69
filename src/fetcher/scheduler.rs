//! Per-tenant fetch loop.
//!
//! Timer-based, like the poller it grew out of: the first cycle runs after
//! `initial_delay`, then every `interval`. Each tick spawns the cycle as
//! its own task, so `stop()` cancels future ticks without interrupting a
//! cycle already in flight. At most one cycle runs per tenant at a time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::diagnostics::{Diagnostics, LogStream};
use crate::error::{FetcherError, PipelineError};
use crate::model::LogLevel;
use crate::pipeline::{AccountOutcome, CycleReport, EmailPipeline};
use crate::tenant::{ResourceRegistry, TenantContext, TenantId};

/// Runs one fetch cycle for a tenant.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, ctx: &TenantContext) -> Result<CycleReport, PipelineError>;
}

#[async_trait]
impl CycleRunner for EmailPipeline {
    async fn run_cycle(&self, ctx: &TenantContext) -> Result<CycleReport, PipelineError> {
        EmailPipeline::run_cycle(self, ctx).await
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub interval: Duration,
    pub initial_delay: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// Result of asking for a cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CycleRun {
    Completed(CycleReport),
    /// Another cycle was already running for this tenant.
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FetcherStatus {
    pub tenant_id: String,
    /// The timer loop is scheduled.
    pub active: bool,
    /// A cycle is in flight.
    pub running: bool,
    pub interval_secs: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub accounts: BTreeMap<String, AccountOutcome>,
}

#[derive(Default)]
struct FetcherState {
    last_started_at: Option<DateTime<Utc>>,
    last_finished_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    accounts: BTreeMap<String, AccountOutcome>,
}

/// Clears the running flag when a cycle ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct TenantFetcher {
    tenant_id: TenantId,
    registry: Arc<ResourceRegistry>,
    runner: Arc<dyn CycleRunner>,
    diagnostics: Arc<Diagnostics>,
    clock: Arc<dyn Clock>,
    config: FetcherConfig,
    running: AtomicBool,
    state: Mutex<FetcherState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TenantFetcher {
    pub fn new(
        tenant_id: TenantId,
        registry: Arc<ResourceRegistry>,
        runner: Arc<dyn CycleRunner>,
        diagnostics: Arc<Diagnostics>,
        clock: Arc<dyn Clock>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            tenant_id,
            registry,
            runner,
            diagnostics,
            clock,
            config,
            running: AtomicBool::new(false),
            state: Mutex::new(FetcherState::default()),
            timer: Mutex::new(None),
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn is_active(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Schedule the loop. Returns false if it was already scheduled.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut timer = self.timer.lock().await;
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let first = self.clock.now()
            + chrono::Duration::from_std(self.config.initial_delay).unwrap_or_default();
        self.state.lock().await.next_run_at = Some(first);

        let weak = Arc::downgrade(self);
        let initial_delay = self.config.initial_delay;
        let interval = self.config.interval;
        *timer = Some(tokio::spawn(timer_loop(weak, initial_delay, interval)));

        info!(
            tenant = %self.tenant_id,
            interval_secs = interval.as_secs(),
            "Fetcher started"
        );
        true
    }

    /// Cancel future cycles. A cycle in flight runs to completion. Returns
    /// false if the loop was not scheduled.
    pub async fn stop(&self) -> bool {
        let handle = self.timer.lock().await.take();
        self.state.lock().await.next_run_at = None;
        match handle {
            Some(handle) => {
                let was_active = !handle.is_finished();
                handle.abort();
                if was_active {
                    info!(tenant = %self.tenant_id, "Fetcher stopped");
                }
                was_active
            }
            None => false,
        }
    }

    /// Run a cycle now and wait for it.
    pub async fn run_once(&self) -> CycleRun {
        self.run_guarded().await
    }

    pub async fn status(&self) -> FetcherStatus {
        let active = self.is_active().await;
        let state = self.state.lock().await;
        FetcherStatus {
            tenant_id: self.tenant_id.to_string(),
            active,
            running: self.is_running(),
            interval_secs: self.config.interval.as_secs(),
            last_started_at: state.last_started_at,
            last_finished_at: state.last_finished_at,
            next_run_at: if active { state.next_run_at } else { None },
            last_error: state.last_error.clone(),
            accounts: state.accounts.clone(),
        }
    }

    async fn run_guarded(&self) -> CycleRun {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(tenant = %self.tenant_id, "Cycle already running, skipping");
            if let Ok(ctx) = self.context().await {
                self.diagnostics
                    .log
                    .info(
                        &ctx,
                        LogStream::Fetcher,
                        "cycle_skip",
                        "A fetch cycle is already running",
                    )
                    .await;
            }
            return CycleRun::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        self.state.lock().await.last_started_at = Some(self.clock.now());
        let result = match self.context().await {
            Ok(ctx) => self.runner.run_cycle(&ctx).await.map_err(FetcherError::from),
            Err(e) => Err(e),
        };

        let finished = self.clock.now();
        let mut state = self.state.lock().await;
        state.last_finished_at = Some(finished);
        match result {
            Ok(report) => {
                state.last_error = None;
                for outcome in &report.accounts {
                    state
                        .accounts
                        .insert(outcome.account_id.clone(), outcome.clone());
                }
                CycleRun::Completed(report)
            }
            Err(e) => {
                let reason = e.to_string();
                state.last_error = Some(reason.clone());
                drop(state);
                warn!(tenant = %self.tenant_id, error = %reason, "Fetch cycle failed");
                if let Ok(ctx) = self.context().await {
                    self.diagnostics
                        .log
                        .record(
                            &ctx,
                            LogStream::Fetcher,
                            LogLevel::Error,
                            "cycle_error",
                            format!("Fetch cycle failed: {reason}"),
                            Some(json!({"error": reason})),
                        )
                        .await;
                }
                CycleRun::Failed { error: reason }
            }
        }
    }

    async fn context(&self) -> Result<TenantContext, FetcherError> {
        Ok(TenantContext::new(
            self.registry.bundle_for(&self.tenant_id).await?,
        ))
    }
}

async fn timer_loop(fetcher: Weak<TenantFetcher>, initial_delay: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(fetcher) = fetcher.upgrade() else {
            return;
        };
        {
            let mut state = fetcher.state.lock().await;
            state.next_run_at = Some(
                fetcher.clock.now() + chrono::Duration::from_std(interval).unwrap_or_default(),
            );
        }
        tokio::spawn(async move {
            fetcher.run_guarded().await;
        });
    }
}
