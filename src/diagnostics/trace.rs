//! Per-tenant execution traces.
//!
//! A trace covers one unit of work (e.g. one director trigger) and holds a
//! bounded list of spans (LLM calls, tool calls, delegations). Payloads are
//! redacted and size-capped before storage. Traces are pruned by capacity
//! and age whenever a new one begins.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::diagnostics::redact::Redactor;
use crate::tenant::TenantContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub request: Option<Value>,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub seed: Value,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub spans: Vec<Span>,
}

pub struct SpanStart {
    pub kind: String,
    pub name: String,
    pub request: Option<Value>,
}

impl SpanStart {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            request: None,
        }
    }

    pub fn with_request(mut self, request: Value) -> Self {
        self.request = Some(request);
        self
    }
}

pub struct SpanEnd {
    pub status: TraceStatus,
    pub error: Option<String>,
    pub response: Option<Value>,
}

impl SpanEnd {
    pub fn ok(response: Option<Value>) -> Self {
        Self {
            status: TraceStatus::Ok,
            error: None,
            response,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: TraceStatus::Error,
            error: Some(error.into()),
            response: None,
        }
    }
}

/// Limits applied at write time.
#[derive(Debug, Clone)]
pub struct TraceLimits {
    pub capacity: usize,
    pub ttl: Duration,
    pub max_spans: usize,
}

impl Default for TraceLimits {
    fn default() -> Self {
        Self {
            capacity: 200,
            ttl: Duration::days(7),
            max_spans: 64,
        }
    }
}

pub struct TraceRecorder {
    clock: Arc<dyn Clock>,
    redactor: Redactor,
    limits: TraceLimits,
}

impl TraceRecorder {
    pub fn new(clock: Arc<dyn Clock>, redactor: Redactor, limits: TraceLimits) -> Self {
        Self {
            clock,
            redactor,
            limits,
        }
    }

    /// Start a trace and return its id. The id is valid even if storing the
    /// trace failed; later calls against it become no-ops.
    pub async fn begin_trace(&self, ctx: &TenantContext, seed: Value) -> String {
        let now = self.clock.now();
        let trace = Trace {
            id: Uuid::new_v4().to_string(),
            seed: self.redactor.sanitize(&seed),
            status: TraceStatus::Running,
            started_at: now,
            ended_at: None,
            duration_ms: None,
            error: None,
            spans: Vec::new(),
        };
        let id = trace.id.clone();
        let cutoff = now - self.limits.ttl;
        let capacity = self.limits.capacity.max(1);
        let result = ctx
            .bundle
            .traces
            .update(move |traces| {
                traces.retain(|t| t.started_at >= cutoff);
                traces.push(trace);
                if traces.len() > capacity {
                    let overflow = traces.len() - capacity;
                    traces.drain(..overflow);
                }
            })
            .await;
        if let Err(e) = result {
            warn!(tenant = %ctx.tenant_id, error = %e, "Failed to store trace");
        }
        id
    }

    pub async fn end_trace(
        &self,
        ctx: &TenantContext,
        trace_id: &str,
        status: TraceStatus,
        error: Option<String>,
    ) {
        let now = self.clock.now();
        let result = ctx
            .bundle
            .traces
            .update(|traces| {
                if let Some(trace) = traces.iter_mut().find(|t| t.id == trace_id) {
                    trace.status = status;
                    trace.error = error;
                    trace.ended_at = Some(now);
                    trace.duration_ms = Some((now - trace.started_at).num_milliseconds());
                }
            })
            .await;
        if let Err(e) = result {
            warn!(tenant = %ctx.tenant_id, trace_id, error = %e, "Failed to close trace");
        }
    }

    /// Open a span. Returns `None` once the trace holds `max_spans` spans,
    /// when the trace is unknown, or when storage fails.
    pub async fn begin_span(
        &self,
        ctx: &TenantContext,
        trace_id: &str,
        start: SpanStart,
    ) -> Option<String> {
        let now = self.clock.now();
        let max_spans = self.limits.max_spans;
        let span = Span {
            id: Uuid::new_v4().to_string(),
            kind: start.kind,
            name: start.name,
            status: TraceStatus::Running,
            started_at: now,
            ended_at: None,
            duration_ms: None,
            request: start.request.map(|r| self.redactor.sanitize(&r)),
            response: None,
            error: None,
        };
        let result = ctx
            .bundle
            .traces
            .update(move |traces| {
                let trace = traces.iter_mut().find(|t| t.id == trace_id)?;
                if trace.spans.len() >= max_spans {
                    return None;
                }
                let id = span.id.clone();
                trace.spans.push(span);
                Some(id)
            })
            .await;
        match result {
            Ok(id) => id,
            Err(e) => {
                warn!(tenant = %ctx.tenant_id, trace_id, error = %e, "Failed to store span");
                None
            }
        }
    }

    pub async fn end_span(&self, ctx: &TenantContext, trace_id: &str, span_id: &str, end: SpanEnd) {
        let now = self.clock.now();
        let response = end.response.map(|r| self.redactor.sanitize(&r));
        let result = ctx
            .bundle
            .traces
            .update(|traces| {
                let span = traces
                    .iter_mut()
                    .find(|t| t.id == trace_id)
                    .and_then(|t| t.spans.iter_mut().find(|s| s.id == span_id));
                if let Some(span) = span {
                    span.status = end.status;
                    span.error = end.error;
                    span.response = response;
                    span.ended_at = Some(now);
                    span.duration_ms = Some((now - span.started_at).num_milliseconds());
                }
            })
            .await;
        if let Err(e) = result {
            warn!(tenant = %ctx.tenant_id, trace_id, error = %e, "Failed to close span");
        }
    }

    pub async fn get_trace(&self, ctx: &TenantContext, trace_id: &str) -> Option<Trace> {
        match ctx.bundle.traces.get_all().await {
            Ok(traces) => traces.into_iter().find(|t| t.id == trace_id),
            Err(e) => {
                warn!(tenant = %ctx.tenant_id, trace_id, error = %e, "Failed to read traces");
                None
            }
        }
    }
}
