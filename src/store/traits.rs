//! Storage traits: a backend-agnostic collection store and the typed
//! per-tenant `Repository<T>` built on top of it.
//!
//! Every tenant collection is a whole JSON array. Writers read the full
//! collection, mutate it, and write it back; there is no versioning.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageError;
use crate::tenant::TenantId;

/// Backend-agnostic durable store of per-tenant JSON collections.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Register the tenant and pre-create any missing collections as empty
    /// arrays. Must be idempotent.
    async fn ensure_tenant(
        &self,
        tenant: &TenantId,
        collections: &[&str],
    ) -> Result<(), StorageError>;

    /// Load the raw JSON body of a collection, if present.
    async fn load(&self, tenant: &TenantId, collection: &str)
    -> Result<Option<String>, StorageError>;

    /// Replace the raw JSON body of a collection.
    async fn save(&self, tenant: &TenantId, collection: &str, body: &str)
    -> Result<(), StorageError>;

    /// All tenants that have ever been initialized.
    async fn list_tenants(&self) -> Result<Vec<TenantId>, StorageError>;
}

/// Typed view of one tenant collection.
pub struct Repository<T> {
    store: Arc<dyn CollectionStore>,
    tenant: TenantId,
    collection: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            tenant: self.tenant.clone(),
            collection: self.collection,
            _marker: PhantomData,
        }
    }
}

impl<T> Repository<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn CollectionStore>, tenant: TenantId, collection: &'static str) -> Self {
        Self {
            store,
            tenant,
            collection,
            _marker: PhantomData,
        }
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    /// Read the whole collection. A missing collection reads as empty.
    pub async fn get_all(&self) -> Result<Vec<T>, StorageError> {
        match self.store.load(&self.tenant, self.collection).await? {
            None => Ok(Vec::new()),
            Some(body) if body.trim().is_empty() => Ok(Vec::new()),
            Some(body) => serde_json::from_str(&body).map_err(|e| StorageError::Serialization {
                collection: self.collection.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Replace the whole collection.
    pub async fn set_all(&self, items: &[T]) -> Result<(), StorageError> {
        let body = serde_json::to_string(items).map_err(|e| StorageError::Serialization {
            collection: self.collection.to_string(),
            reason: e.to_string(),
        })?;
        self.store.save(&self.tenant, self.collection, &body).await
    }

    /// Read-modify-write the whole collection.
    pub async fn update<F, R>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Vec<T>) -> R + Send,
        R: Send,
    {
        let mut items = self.get_all().await?;
        let result = f(&mut items);
        self.set_all(&items).await?;
        Ok(result)
    }

    /// Append one item, keeping at most `max_len` of the newest items. The
    /// new item is always kept, even when `max_len` is 0.
    pub async fn append(&self, item: T, max_len: usize) -> Result<(), StorageError> {
        let max_len = max_len.max(1);
        self.update(move |items| {
            items.push(item);
            if items.len() > max_len {
                let overflow = items.len() - max_len;
                items.drain(..overflow);
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        n: u32,
    }

    fn repo(store: Arc<MemoryStore>) -> Repository<Item> {
        Repository::new(store, TenantId::parse("t1").unwrap(), "items")
    }

    #[tokio::test]
    async fn missing_collection_reads_empty() {
        let repo = repo(Arc::new(MemoryStore::new()));
        assert!(repo.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_all_then_get_all() {
        let repo = repo(Arc::new(MemoryStore::new()));
        repo.set_all(&[Item { n: 1 }, Item { n: 2 }]).await.unwrap();
        assert_eq!(repo.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn append_keeps_newest() {
        let repo = repo(Arc::new(MemoryStore::new()));
        for n in 0..5 {
            repo.append(Item { n }, 3).await.unwrap();
        }
        let items = repo.get_all().await.unwrap();
        assert_eq!(items, vec![Item { n: 2 }, Item { n: 3 }, Item { n: 4 }]);
    }

    #[tokio::test]
    async fn append_with_zero_capacity_keeps_new_item() {
        let repo = repo(Arc::new(MemoryStore::new()));
        repo.append(Item { n: 1 }, 0).await.unwrap();
        repo.append(Item { n: 2 }, 0).await.unwrap();
        assert_eq!(repo.get_all().await.unwrap(), vec![Item { n: 2 }]);
    }

    #[tokio::test]
    async fn corrupt_body_is_a_serialization_error() {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId::parse("t1").unwrap();
        store.save(&tenant, "items", "{not json").await.unwrap();
        let err = repo(store).get_all().await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }
}
