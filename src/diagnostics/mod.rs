//! Tenant-scoped diagnostics: traces, structured logs and payload redaction.

pub mod log;
pub mod redact;
pub mod trace;

use std::sync::Arc;

pub use log::{LogStream, TenantLog};
pub use redact::Redactor;
pub use trace::{Span, SpanEnd, SpanStart, Trace, TraceLimits, TraceRecorder, TraceStatus};

use crate::clock::Clock;

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    pub trace_capacity: usize,
    pub trace_ttl: chrono::Duration,
    pub spans_per_trace: usize,
    /// Stored payloads larger than this are truncated.
    pub payload_bytes: usize,
    pub redact_keys: Vec<String>,
    pub log_capacity: usize,
    pub log_ttl: chrono::Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            trace_capacity: 200,
            trace_ttl: chrono::Duration::days(7),
            spans_per_trace: 64,
            payload_bytes: 16 * 1024,
            redact_keys: redact::DEFAULT_REDACT_KEYS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            log_capacity: 500,
            log_ttl: chrono::Duration::days(7),
        }
    }
}

/// Tracer and tenant log sharing one clock and redaction policy.
pub struct Diagnostics {
    pub tracer: TraceRecorder,
    pub log: TenantLog,
}

impl Diagnostics {
    pub fn new(clock: Arc<dyn Clock>, config: &DiagnosticsConfig) -> Self {
        let redactor = Redactor::new(&config.redact_keys, config.payload_bytes);
        Self {
            tracer: TraceRecorder::new(
                Arc::clone(&clock),
                redactor.clone(),
                TraceLimits {
                    capacity: config.trace_capacity,
                    ttl: config.trace_ttl,
                    max_spans: config.spans_per_trace,
                },
            ),
            log: TenantLog::new(clock, redactor, config.log_capacity, config.log_ttl),
        }
    }
}
