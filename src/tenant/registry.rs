//! Per-tenant resource registry.
//!
//! A keyed cache of `ResourceBundle`s with LRU capacity eviction and an idle
//! sweep. Eviction only drops the cached handle: durable state stays in the
//! `CollectionStore` and the next access rebuilds the bundle from it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::diagnostics::trace::Trace;
use crate::error::{RegistryError, StorageError};
use crate::model::{
    Agent, ApiConfig, ConversationThread, Director, Filter, LogEntry, MailAccount,
    ProcessedMessage, Prompt, TenantSettings,
};
use crate::store::{CollectionStore, Repository, collections};
use crate::tenant::{TenantContext, TenantId};

/// Registry sizing and lifetime.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of live bundles.
    pub capacity: usize,
    /// Bundles untouched for this long are dropped by the sweep.
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            idle_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Typed repositories for one tenant.
pub struct ResourceBundle {
    pub tenant_id: TenantId,
    pub accounts: Repository<MailAccount>,
    /// Single-record collection.
    pub settings: Repository<TenantSettings>,
    pub filters: Repository<Filter>,
    pub directors: Repository<Director>,
    pub agents: Repository<Agent>,
    pub prompts: Repository<Prompt>,
    pub api_configs: Repository<ApiConfig>,
    pub conversations: Repository<ConversationThread>,
    pub processed_messages: Repository<ProcessedMessage>,
    pub fetcher_log: Repository<LogEntry>,
    pub orchestration_log: Repository<LogEntry>,
    pub provider_events: Repository<LogEntry>,
    pub traces: Repository<Trace>,
    conversation_writer: Mutex<()>,
}

impl ResourceBundle {
    pub fn new(store: Arc<dyn CollectionStore>, tenant_id: TenantId) -> Self {
        let store = &store;
        let tenant = &tenant_id;
        Self {
            accounts: repository(store, tenant, collections::ACCOUNTS),
            settings: repository(store, tenant, collections::SETTINGS),
            filters: repository(store, tenant, collections::FILTERS),
            directors: repository(store, tenant, collections::DIRECTORS),
            agents: repository(store, tenant, collections::AGENTS),
            prompts: repository(store, tenant, collections::PROMPTS),
            api_configs: repository(store, tenant, collections::API_CONFIGS),
            conversations: repository(store, tenant, collections::CONVERSATIONS),
            processed_messages: repository(store, tenant, collections::PROCESSED_MESSAGES),
            fetcher_log: repository(store, tenant, collections::FETCHER_LOG),
            orchestration_log: repository(store, tenant, collections::ORCHESTRATION_LOG),
            provider_events: repository(store, tenant, collections::PROVIDER_EVENTS),
            traces: repository(store, tenant, collections::TRACES),
            conversation_writer: Mutex::new(()),
            tenant_id: tenant_id.clone(),
        }
    }

    /// Stored settings, or defaults when none were written yet.
    pub async fn load_settings(&self) -> Result<TenantSettings, StorageError> {
        Ok(self
            .settings
            .get_all()
            .await?
            .into_iter()
            .next()
            .unwrap_or_default())
    }

    pub async fn save_settings(&self, settings: TenantSettings) -> Result<(), StorageError> {
        self.settings.set_all(&[settings]).await
    }

    /// Serializes conversation read-modify-write cycles within this process.
    pub async fn lock_conversations(&self) -> MutexGuard<'_, ()> {
        self.conversation_writer.lock().await
    }
}

fn repository<T>(
    store: &Arc<dyn CollectionStore>,
    tenant: &TenantId,
    collection: &'static str,
) -> Repository<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
{
    Repository::new(Arc::clone(store), tenant.clone(), collection)
}

struct Entry {
    cell: Arc<OnceCell<Arc<ResourceBundle>>>,
    last_accessed: DateTime<Utc>,
}

/// Keyed store of live tenant bundles.
pub struct ResourceRegistry {
    store: Arc<dyn CollectionStore>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    entries: Mutex<HashMap<TenantId, Entry>>,
}

impl ResourceRegistry {
    pub fn new(
        store: Arc<dyn CollectionStore>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CollectionStore> {
        &self.store
    }

    /// Validate `uid` and return its bundle, materializing it on first use.
    pub async fn get_bundle(&self, uid: &str) -> Result<Arc<ResourceBundle>, RegistryError> {
        let tenant = TenantId::parse(uid)?;
        self.bundle_for(&tenant).await
    }

    /// Bundle for an already validated tenant id.
    pub async fn bundle_for(&self, tenant: &TenantId) -> Result<Arc<ResourceBundle>, RegistryError> {
        let now = self.clock.now();
        let cell = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(tenant) {
                Some(entry) => {
                    entry.last_accessed = now;
                    Arc::clone(&entry.cell)
                }
                None => {
                    if entries.len() >= self.config.capacity.max(1) {
                        evict_lru(&mut entries);
                    }
                    let cell = Arc::new(OnceCell::new());
                    entries.insert(
                        tenant.clone(),
                        Entry {
                            cell: Arc::clone(&cell),
                            last_accessed: now,
                        },
                    );
                    cell
                }
            }
        };

        let init = cell
            .get_or_try_init(|| async {
                self.store.ensure_tenant(tenant, collections::ALL).await?;
                debug!(tenant = %tenant, "Materialized tenant bundle");
                Ok::<_, StorageError>(Arc::new(ResourceBundle::new(
                    Arc::clone(&self.store),
                    tenant.clone(),
                )))
            })
            .await;

        match init {
            Ok(bundle) => Ok(Arc::clone(bundle)),
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Tenant initialization failed");
                let mut entries = self.entries.lock().await;
                if entries
                    .get(tenant)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.cell, &cell))
                {
                    entries.remove(tenant);
                }
                Err(e.into())
            }
        }
    }

    pub async fn context(&self, uid: &str) -> Result<TenantContext, RegistryError> {
        Ok(TenantContext::new(self.get_bundle(uid).await?))
    }

    /// Drop every bundle idle for at least the configured TTL. Returns the
    /// number evicted.
    pub async fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.config.idle_ttl).unwrap_or(chrono::Duration::MAX);
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|tenant, entry| {
            let keep = now - entry.last_accessed < ttl;
            if !keep {
                debug!(tenant = %tenant, "Evicting idle tenant bundle");
            }
            keep
        });
        before - entries.len()
    }

    pub async fn evict(&self, tenant: &TenantId) -> bool {
        self.entries.lock().await.remove(tenant).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, tenant: &TenantId) -> bool {
        self.entries.lock().await.contains_key(tenant)
    }

    /// Run `evict_idle` every `sweep_interval`.
    pub fn spawn_sweep_task(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle().await;
                if evicted > 0 {
                    info!(evicted, "Registry sweep evicted idle bundles");
                }
            }
        })
    }
}

fn evict_lru(entries: &mut HashMap<TenantId, Entry>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_accessed)
        .map(|(tenant, _)| tenant.clone());
    if let Some(tenant) = oldest {
        debug!(tenant = %tenant, "Evicting least recently used tenant bundle");
        entries.remove(&tenant);
    }
}
