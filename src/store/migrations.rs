//! Schema versions for the libSQL collection store.
//!
//! Each pending step runs in one transaction together with its row in
//! `_schema_versions`, so a failed step leaves no partial schema behind.

use libsql::Connection;

use crate::error::StorageError;

struct SchemaStep {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered schema steps. Append only.
const STEPS: &[SchemaStep] = &[SchemaStep {
    version: 1,
    name: "tenant_collections",
    sql: "
        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS collections (
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            body TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, name)
        );
        CREATE INDEX IF NOT EXISTS idx_collections_tenant ON collections(tenant_id);
    ",
}];

fn schema_err(context: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Migration(format!("{context}: {e}"))
}

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| schema_err("create _schema_versions", e))?;

    let applied = schema_version(conn).await?;
    for step in STEPS.iter().filter(|s| s.version > applied) {
        tracing::info!(version = step.version, name = step.name, "Applying schema step");
        // Names are static identifiers, so inlining them is safe.
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _schema_versions (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(schema_err(
                &format!("schema step {} ({})", step.version, step.name),
                e,
            ));
        }
    }
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
pub async fn schema_version(conn: &Connection) -> Result<i64, StorageError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _schema_versions", ())
        .await
        .map_err(|e| schema_err("read schema version", e))?;
    match rows.next().await.map_err(|e| schema_err("read schema version", e))? {
        Some(row) => row.get::<i64>(0).map_err(|e| schema_err("decode schema version", e)),
        None => Ok(0),
    }
}
