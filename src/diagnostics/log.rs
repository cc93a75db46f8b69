//! Tenant-scoped structured logs (fetcher, orchestration, provider events).
//!
//! Entries are pruned by capacity and age at write time, their detail is
//! redacted, and each one is mirrored as a `tracing` event. A failed write is
//! reported with `warn!` and otherwise ignored.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::diagnostics::redact::Redactor;
use crate::error::StorageError;
use crate::model::{LogEntry, LogLevel};
use crate::store::Repository;
use crate::tenant::TenantContext;

/// Which tenant log an entry goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Fetcher,
    Orchestration,
    ProviderEvents,
}

impl LogStream {
    pub fn name(self) -> &'static str {
        match self {
            Self::Fetcher => "fetcher",
            Self::Orchestration => "orchestration",
            Self::ProviderEvents => "provider_events",
        }
    }

    fn repository(self, ctx: &TenantContext) -> &Repository<LogEntry> {
        match self {
            Self::Fetcher => &ctx.bundle.fetcher_log,
            Self::Orchestration => &ctx.bundle.orchestration_log,
            Self::ProviderEvents => &ctx.bundle.provider_events,
        }
    }
}

pub struct TenantLog {
    clock: Arc<dyn Clock>,
    redactor: Redactor,
    capacity: usize,
    ttl: Duration,
}

impl TenantLog {
    pub fn new(clock: Arc<dyn Clock>, redactor: Redactor, capacity: usize, ttl: Duration) -> Self {
        Self {
            clock,
            redactor,
            capacity,
            ttl,
        }
    }

    pub async fn record(
        &self,
        ctx: &TenantContext,
        stream: LogStream,
        level: LogLevel,
        event: &str,
        message: impl Into<String>,
        detail: Option<Value>,
    ) {
        let message = message.into();
        let tenant = ctx.tenant_id.as_str();
        let log = stream.name();
        match level {
            LogLevel::Debug => debug!(tenant, log, event, "{message}"),
            LogLevel::Info => info!(tenant, log, event, "{message}"),
            LogLevel::Warn => warn!(tenant, log, event, "{message}"),
            LogLevel::Error => error!(tenant, log, event, "{message}"),
        }

        let now = self.clock.now();
        let entry = LogEntry {
            timestamp: now,
            level,
            event: event.to_string(),
            message,
            detail: detail.map(|d| self.redactor.sanitize(&d)),
        };
        let cutoff = now - self.ttl;
        let capacity = self.capacity.max(1);
        let result = stream
            .repository(ctx)
            .update(move |entries| {
                entries.retain(|e| e.timestamp >= cutoff);
                entries.push(entry);
                if entries.len() > capacity {
                    let overflow = entries.len() - capacity;
                    entries.drain(..overflow);
                }
            })
            .await;
        if let Err(e) = result {
            warn!(tenant, log, error = %e, "Failed to persist log entry");
        }
    }

    pub async fn info(
        &self,
        ctx: &TenantContext,
        stream: LogStream,
        event: &str,
        message: impl Into<String>,
    ) {
        self.record(ctx, stream, LogLevel::Info, event, message, None)
            .await;
    }

    pub async fn warn(
        &self,
        ctx: &TenantContext,
        stream: LogStream,
        event: &str,
        message: impl Into<String>,
        detail: Option<Value>,
    ) {
        self.record(ctx, stream, LogLevel::Warn, event, message, detail)
            .await;
    }

    pub async fn error(
        &self,
        ctx: &TenantContext,
        stream: LogStream,
        event: &str,
        message: impl Into<String>,
        detail: Option<Value>,
    ) {
        self.record(ctx, stream, LogLevel::Error, event, message, detail)
            .await;
    }

    /// Newest `limit` entries, newest last.
    pub async fn recent(
        &self,
        ctx: &TenantContext,
        stream: LogStream,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StorageError> {
        let mut entries = stream.repository(ctx).get_all().await?;
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::tenant::{ResourceBundle, TenantId};
    use serde_json::json;

    fn ctx() -> TenantContext {
        let bundle = ResourceBundle::new(
            Arc::new(MemoryStore::new()),
            TenantId::parse("t1").unwrap(),
        );
        TenantContext::new(Arc::new(bundle))
    }

    #[tokio::test]
    async fn prunes_by_capacity_and_age() {
        let clock = Arc::new(ManualClock::default());
        let log = TenantLog::new(
            clock.clone(),
            Redactor::default(),
            3,
            Duration::hours(1),
        );
        let ctx = ctx();

        log.info(&ctx, LogStream::Fetcher, "old", "stale").await;
        clock.advance(Duration::hours(2));
        for i in 0..4 {
            log.info(&ctx, LogStream::Fetcher, "tick", format!("n{i}"))
                .await;
        }

        let entries = log.recent(&ctx, LogStream::Fetcher, 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.event == "tick"));
        assert_eq!(entries[2].message, "n3");
    }

    #[tokio::test]
    async fn detail_is_redacted_and_streams_are_separate() {
        let log = TenantLog::new(
            Arc::new(ManualClock::default()),
            Redactor::default(),
            10,
            Duration::days(1),
        );
        let ctx = ctx();
        log.warn(
            &ctx,
            LogStream::ProviderEvents,
            "token_refresh",
            "refreshed",
            Some(json!({"access_token": "ya29.x", "account": "a1"})),
        )
        .await;

        let events = log
            .recent(&ctx, LogStream::ProviderEvents, 10)
            .await
            .unwrap();
        let detail = events[0].detail.as_ref().unwrap();
        assert_eq!(detail["access_token"], "[REDACTED]");
        assert_eq!(detail["account"], "a1");
        assert!(
            log.recent(&ctx, LogStream::Fetcher, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
