//! libSQL backend: durable `CollectionStore` implementation.
//!
//! Each tenant collection is one row in `collections`, holding the whole
//! JSON array. Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::store::migrations;
use crate::store::traits::CollectionStore;
use crate::tenant::TenantId;

/// libSQL collection store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Collection store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StorageError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StorageError> {
        let conn = db
            .connect()
            .map_err(|e| StorageError::Connection(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }
}

#[async_trait]
impl CollectionStore for LibSqlStore {
    async fn ensure_tenant(
        &self,
        tenant: &TenantId,
        collections: &[&str],
    ) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO tenants (id, created_at) VALUES (?1, ?2)",
                params![tenant.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| StorageError::Query(format!("ensure_tenant: {e}")))?;

        for name in collections {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO collections (tenant_id, name, body, updated_at)
                     VALUES (?1, ?2, '[]', ?3)",
                    params![tenant.as_str(), *name, now.as_str()],
                )
                .await
                .map_err(|e| StorageError::Query(format!("ensure_tenant({name}): {e}")))?;
        }
        debug!(tenant = %tenant, "Tenant collections ensured");
        Ok(())
    }

    async fn load(
        &self,
        tenant: &TenantId,
        collection: &str,
    ) -> Result<Option<String>, StorageError> {
        let mut rows = self
            .conn
            .query(
                "SELECT body FROM collections WHERE tenant_id = ?1 AND name = ?2",
                params![tenant.as_str(), collection],
            )
            .await
            .map_err(|e| StorageError::Query(format!("load({collection}): {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StorageError::Query(format!("load({collection}): {e}")))?;

        match row {
            Some(row) => {
                let body: String = row
                    .get(0)
                    .map_err(|e| StorageError::Query(format!("load({collection}): {e}")))?;
                Ok(Some(body))
            }
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        tenant: &TenantId,
        collection: &str,
        body: &str,
    ) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO collections (tenant_id, name, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tenant_id, name)
                 DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![tenant.as_str(), collection, body, now.as_str()],
            )
            .await
            .map_err(|e| StorageError::Query(format!("save({collection}): {e}")))?;
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>, StorageError> {
        let mut rows = self
            .conn
            .query("SELECT id FROM tenants ORDER BY id ASC", ())
            .await
            .map_err(|e| StorageError::Query(format!("list_tenants: {e}")))?;

        let mut tenants = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let raw: String = match row.get(0) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Skipping tenant row: {e}");
                    continue;
                }
            };
            match TenantId::parse(&raw) {
                Ok(id) => tenants.push(id),
                Err(e) => warn!("Skipping stored tenant with invalid id: {e}"),
            }
        }
        Ok(tenants)
    }
}
