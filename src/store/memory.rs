//! In-memory `CollectionStore` for tests and ephemeral deployments.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::store::traits::CollectionStore;
use crate::tenant::TenantId;

/// In-memory collection store. Tracks how many times each tenant has been
/// initialized.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<(TenantId, String), String>>,
    tenants: RwLock<BTreeSet<TenantId>>,
    init_counts: RwLock<HashMap<TenantId, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `ensure_tenant` calls seen for a tenant.
    pub async fn init_count(&self, tenant: &TenantId) -> usize {
        self.init_counts
            .read()
            .await
            .get(tenant)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn ensure_tenant(
        &self,
        tenant: &TenantId,
        collections: &[&str],
    ) -> Result<(), StorageError> {
        *self
            .init_counts
            .write()
            .await
            .entry(tenant.clone())
            .or_insert(0) += 1;
        self.tenants.write().await.insert(tenant.clone());

        let mut stored = self.collections.write().await;
        for name in collections {
            stored
                .entry((tenant.clone(), (*name).to_string()))
                .or_insert_with(|| "[]".to_string());
        }
        Ok(())
    }

    async fn load(
        &self,
        tenant: &TenantId,
        collection: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .collections
            .read()
            .await
            .get(&(tenant.clone(), collection.to_string()))
            .cloned())
    }

    async fn save(
        &self,
        tenant: &TenantId,
        collection: &str,
        body: &str,
    ) -> Result<(), StorageError> {
        self.collections
            .write()
            .await
            .insert((tenant.clone(), collection.to_string()), body.to_string());
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>, StorageError> {
        Ok(self.tenants.read().await.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_tenant_is_idempotent() {
        let store = MemoryStore::new();
        let t = TenantId::parse("alice").unwrap();
        store.ensure_tenant(&t, &["a", "b"]).await.unwrap();
        store.save(&t, "a", "[1]").await.unwrap();
        store.ensure_tenant(&t, &["a", "b"]).await.unwrap();

        assert_eq!(store.load(&t, "a").await.unwrap().as_deref(), Some("[1]"));
        assert_eq!(store.load(&t, "b").await.unwrap().as_deref(), Some("[]"));
        assert_eq!(store.init_count(&t).await, 2);
        assert_eq!(store.list_tenants().await.unwrap(), vec![t]);
    }
}
