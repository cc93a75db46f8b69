//! Keyed store of per-tenant fetchers.
//!
//! Fetchers are created lazily, bounded by an LRU capacity, and swept when
//! inactive for the idle TTL. `start`/`stop` persist the tenant's
//! `fetcher_auto_start` intent, which `bootstrap()` replays on restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::diagnostics::{Diagnostics, LogStream};
use crate::error::FetcherError;
use crate::fetcher::scheduler::{CycleRun, CycleRunner, FetcherConfig, FetcherStatus, TenantFetcher};
use crate::tenant::{ResourceRegistry, TenantContext, TenantId};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub capacity: usize,
    /// Inactive fetchers untouched for this long are dropped by the sweep.
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
    /// Tenants started in parallel by `bootstrap()`.
    pub bootstrap_concurrency: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            idle_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            bootstrap_concurrency: 4,
        }
    }
}

/// Outcome of `bootstrap()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BootstrapReport {
    /// Tenants whose loop was started.
    pub started: Vec<String>,
    /// Tenants whose start attempt failed.
    pub failed: Vec<String>,
}

struct Entry {
    fetcher: Arc<TenantFetcher>,
    last_accessed: DateTime<Utc>,
}

pub struct FetcherManager {
    registry: Arc<ResourceRegistry>,
    runner: Arc<dyn CycleRunner>,
    diagnostics: Arc<Diagnostics>,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
    fetcher_config: FetcherConfig,
    fetchers: Mutex<HashMap<TenantId, Entry>>,
}

impl FetcherManager {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        runner: Arc<dyn CycleRunner>,
        diagnostics: Arc<Diagnostics>,
        clock: Arc<dyn Clock>,
        config: ManagerConfig,
        fetcher_config: FetcherConfig,
    ) -> Self {
        Self {
            registry,
            runner,
            diagnostics,
            clock,
            config,
            fetcher_config,
            fetchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Fetcher for `uid`, created on first use.
    pub async fn get_or_create(&self, uid: &str) -> Result<Arc<TenantFetcher>, FetcherError> {
        let tenant = TenantId::parse(uid)?;
        let now = self.clock.now();
        let mut fetchers = self.fetchers.lock().await;
        if let Some(entry) = fetchers.get_mut(&tenant) {
            entry.last_accessed = now;
            return Ok(Arc::clone(&entry.fetcher));
        }

        if fetchers.len() >= self.config.capacity.max(1)
            && let Some(evicted) = take_lru(&mut fetchers)
        {
            debug!(tenant = %evicted.tenant_id(), "Evicting least recently used fetcher");
            evicted.stop().await;
        }

        let fetcher = Arc::new(TenantFetcher::new(
            tenant.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.runner),
            Arc::clone(&self.diagnostics),
            Arc::clone(&self.clock),
            self.fetcher_config.clone(),
        ));
        fetchers.insert(
            tenant,
            Entry {
                fetcher: Arc::clone(&fetcher),
                last_accessed: now,
            },
        );
        Ok(fetcher)
    }

    /// Start the tenant's loop and persist the intent.
    pub async fn start(&self, uid: &str) -> Result<FetcherStatus, FetcherError> {
        let fetcher = self.get_or_create(uid).await?;
        self.set_auto_start(fetcher.tenant_id(), true).await?;
        fetcher.start().await;
        Ok(fetcher.status().await)
    }

    /// Stop the tenant's loop and persist the intent.
    pub async fn stop(&self, uid: &str) -> Result<FetcherStatus, FetcherError> {
        let fetcher = self.get_or_create(uid).await?;
        self.set_auto_start(fetcher.tenant_id(), false).await?;
        fetcher.stop().await;
        Ok(fetcher.status().await)
    }

    pub async fn run_once(&self, uid: &str) -> Result<CycleRun, FetcherError> {
        Ok(self.get_or_create(uid).await?.run_once().await)
    }

    pub async fn status(&self, uid: &str) -> Result<FetcherStatus, FetcherError> {
        Ok(self.get_or_create(uid).await?.status().await)
    }

    pub async fn len(&self) -> usize {
        self.fetchers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.fetchers.lock().await.is_empty()
    }

    pub async fn contains(&self, uid: &str) -> bool {
        match TenantId::parse(uid) {
            Ok(tenant) => self.fetchers.lock().await.contains_key(&tenant),
            Err(_) => false,
        }
    }

    async fn set_auto_start(&self, tenant: &TenantId, enabled: bool) -> Result<(), FetcherError> {
        let bundle = self.registry.bundle_for(tenant).await?;
        let mut settings = bundle.load_settings().await?;
        if settings.fetcher_auto_start != enabled {
            settings.fetcher_auto_start = enabled;
            bundle.save_settings(settings).await?;
        }
        Ok(())
    }

    /// Drop fetchers that are neither scheduled nor running and have been
    /// untouched for the idle TTL. Returns the number dropped.
    pub async fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.config.idle_ttl).unwrap_or(chrono::Duration::MAX);
        let mut fetchers = self.fetchers.lock().await;

        let mut idle = Vec::new();
        for (tenant, entry) in fetchers.iter() {
            if now - entry.last_accessed >= ttl
                && !entry.fetcher.is_running()
                && !entry.fetcher.is_active().await
            {
                idle.push(tenant.clone());
            }
        }
        for tenant in &idle {
            debug!(tenant = %tenant, "Evicting idle fetcher");
            fetchers.remove(tenant);
        }
        idle.len()
    }

    /// Run `evict_idle` every `sweep_interval`.
    pub fn spawn_sweep_task(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = manager.evict_idle().await;
                if evicted > 0 {
                    info!(evicted, "Fetcher sweep evicted idle fetchers");
                }
            }
        })
    }

    /// Start the loop of every stored tenant with `fetcher_auto_start` set,
    /// using a bounded pool of workers over a shared queue. One tenant's
    /// failure never blocks the others.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<BootstrapReport, FetcherError> {
        let tenants = self.registry.store().list_tenants().await?;
        if tenants.is_empty() {
            return Ok(BootstrapReport::default());
        }
        let workers = self.config.bootstrap_concurrency.clamp(1, tenants.len());
        info!(tenants = tenants.len(), workers, "Bootstrapping fetchers");

        let queue = Arc::new(Mutex::new(VecDeque::from(tenants)));
        let mut set = JoinSet::new();
        for _ in 0..workers {
            let manager = Arc::clone(self);
            let queue = Arc::clone(&queue);
            set.spawn(async move {
                let mut report = BootstrapReport::default();
                loop {
                    let Some(tenant) = queue.lock().await.pop_front() else {
                        break;
                    };
                    match manager.bootstrap_tenant(&tenant).await {
                        Ok(true) => report.started.push(tenant.to_string()),
                        Ok(false) => {}
                        Err(e) => {
                            manager.record_bootstrap_error(&tenant, &e).await;
                            report.failed.push(tenant.to_string());
                        }
                    }
                }
                report
            });
        }

        let mut report = BootstrapReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(part) => {
                    report.started.extend(part.started);
                    report.failed.extend(part.failed);
                }
                Err(e) => error!(error = %e, "Bootstrap worker panicked"),
            }
        }
        report.started.sort();
        report.failed.sort();
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "Fetcher bootstrap complete"
        );
        Ok(report)
    }

    async fn bootstrap_tenant(&self, tenant: &TenantId) -> Result<bool, FetcherError> {
        let bundle = self.registry.bundle_for(tenant).await?;
        if !bundle.load_settings().await?.fetcher_auto_start {
            return Ok(false);
        }
        let fetcher = self.get_or_create(tenant.as_str()).await?;
        fetcher.start().await;
        Ok(true)
    }

    async fn record_bootstrap_error(&self, tenant: &TenantId, err: &FetcherError) {
        warn!(tenant = %tenant, error = %err, "Failed to bootstrap fetcher");
        match self.registry.bundle_for(tenant).await {
            Ok(bundle) => {
                self.diagnostics
                    .log
                    .error(
                        &TenantContext::new(bundle),
                        LogStream::Fetcher,
                        "bootstrap_error",
                        format!("Failed to start fetcher on boot: {err}"),
                        Some(json!({"error": err.to_string()})),
                    )
                    .await;
            }
            Err(e) => warn!(tenant = %tenant, error = %e, "Cannot record bootstrap error"),
        }
    }

    /// Stop every loop. Persisted intent is left untouched so the next
    /// bootstrap resumes the same tenants.
    pub async fn shutdown(&self) {
        let fetchers: Vec<Arc<TenantFetcher>> = self
            .fetchers
            .lock()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.fetcher))
            .collect();
        let stopped = join_all(fetchers.iter().map(|f| f.stop()))
            .await
            .into_iter()
            .filter(|was_active| *was_active)
            .count();
        info!(stopped, "Fetchers shut down");
    }
}

fn take_lru(fetchers: &mut HashMap<TenantId, Entry>) -> Option<Arc<TenantFetcher>> {
    let oldest = fetchers
        .iter()
        .min_by_key(|(_, entry)| entry.last_accessed)
        .map(|(tenant, _)| tenant.clone())?;
    fetchers.remove(&oldest).map(|entry| entry.fetcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::diagnostics::DiagnosticsConfig;
    use crate::error::PipelineError;
    use crate::pipeline::CycleReport;
    use crate::store::{CollectionStore, MemoryStore, collections};
    use crate::tenant::RegistryConfig;
    use async_trait::async_trait;

    struct NoopRunner;

    #[async_trait]
    impl CycleRunner for NoopRunner {
        async fn run_cycle(&self, _ctx: &TenantContext) -> Result<CycleReport, PipelineError> {
            Ok(CycleReport {
                started_at: Utc::now(),
                finished_at: Utc::now(),
                accounts: vec![],
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        registry: Arc<ResourceRegistry>,
        diagnostics: Arc<Diagnostics>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let clock = Arc::new(ManualClock::default());
            let registry = Arc::new(ResourceRegistry::new(
                store.clone(),
                clock.clone(),
                RegistryConfig::default(),
            ));
            let diagnostics =
                Arc::new(Diagnostics::new(clock.clone(), &DiagnosticsConfig::default()));
            Self {
                store,
                clock,
                registry,
                diagnostics,
            }
        }

        fn manager(&self, config: ManagerConfig) -> Arc<FetcherManager> {
            Arc::new(FetcherManager::new(
                self.registry.clone(),
                Arc::new(NoopRunner),
                self.diagnostics.clone(),
                self.clock.clone(),
                config,
                FetcherConfig {
                    interval: Duration::from_secs(3600),
                    initial_delay: Duration::from_secs(3600),
                },
            ))
        }
    }

    #[tokio::test]
    async fn start_persists_intent_and_bootstrap_replays_it() {
        let f = Fixture::new();
        let first = f.manager(ManagerConfig::default());
        assert!(first.start("alpha").await.unwrap().active);
        first.status("beta").await.unwrap();
        first.shutdown().await;

        let bundle = f.registry.get_bundle("alpha").await.unwrap();
        assert!(bundle.load_settings().await.unwrap().fetcher_auto_start);

        let second = f.manager(ManagerConfig::default());
        let report = second.bootstrap().await.unwrap();
        assert_eq!(report.started, vec!["alpha".to_string()]);
        assert!(report.failed.is_empty());
        assert!(second.status("alpha").await.unwrap().active);
        assert!(!second.status("beta").await.unwrap().active);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn stop_clears_intent() {
        let f = Fixture::new();
        let manager = f.manager(ManagerConfig::default());
        manager.start("alpha").await.unwrap();
        let status = manager.stop("alpha").await.unwrap();
        assert!(!status.active);

        let bundle = f.registry.get_bundle("alpha").await.unwrap();
        assert!(!bundle.load_settings().await.unwrap().fetcher_auto_start);
    }

    #[tokio::test]
    async fn shutdown_keeps_intent() {
        let f = Fixture::new();
        let manager = f.manager(ManagerConfig::default());
        manager.start("alpha").await.unwrap();
        manager.shutdown().await;
        assert!(!manager.status("alpha").await.unwrap().active);

        let bundle = f.registry.get_bundle("alpha").await.unwrap();
        assert!(bundle.load_settings().await.unwrap().fetcher_auto_start);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used_and_stops_it() {
        let f = Fixture::new();
        let manager = f.manager(ManagerConfig {
            capacity: 2,
            ..ManagerConfig::default()
        });
        let a = manager.get_or_create("a").await.unwrap();
        a.start().await;
        f.clock.advance(chrono::Duration::seconds(1));
        manager.get_or_create("b").await.unwrap();
        f.clock.advance(chrono::Duration::seconds(1));
        manager.get_or_create("c").await.unwrap();

        assert_eq!(manager.len().await, 2);
        assert!(!manager.contains("a").await);
        assert!(!a.is_active().await);
    }

    #[tokio::test]
    async fn idle_sweep_drops_only_inactive_fetchers() {
        let f = Fixture::new();
        let manager = f.manager(ManagerConfig {
            idle_ttl: Duration::from_secs(600),
            ..ManagerConfig::default()
        });
        manager.start("busy").await.unwrap();
        manager.status("quiet").await.unwrap();

        f.clock.advance(chrono::Duration::seconds(300));
        assert_eq!(manager.evict_idle().await, 0);

        f.clock.advance(chrono::Duration::seconds(301));
        assert_eq!(manager.evict_idle().await, 1);
        assert!(manager.contains("busy").await);
        assert!(!manager.contains("quiet").await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn bootstrap_isolates_failures() {
        let f = Fixture::new();
        let manager = f.manager(ManagerConfig {
            bootstrap_concurrency: 2,
            ..ManagerConfig::default()
        });
        for uid in ["a", "b", "c"] {
            manager.start(uid).await.unwrap();
        }
        manager.shutdown().await;

        let broken = TenantId::parse("b").unwrap();
        f.store
            .save(&broken, collections::SETTINGS, "not json")
            .await
            .unwrap();

        let fresh = f.manager(ManagerConfig {
            bootstrap_concurrency: 2,
            ..ManagerConfig::default()
        });
        let report = fresh.bootstrap().await.unwrap();
        assert_eq!(report.started, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(report.failed, vec!["b".to_string()]);

        let ctx = f.registry.context("b").await.unwrap();
        let log = f
            .diagnostics
            .log
            .recent(&ctx, LogStream::Fetcher, 10)
            .await
            .unwrap();
        assert!(log.iter().any(|e| e.event == "bootstrap_error"));
        fresh.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_uid_is_rejected() {
        let f = Fixture::new();
        let manager = f.manager(ManagerConfig::default());
        let err = manager.start("../etc").await.unwrap_err();
        assert!(matches!(err, FetcherError::Tenant(_)));
        assert!(manager.is_empty().await);
    }
}
