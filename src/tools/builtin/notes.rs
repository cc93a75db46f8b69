//! Note-taking tool that writes into the tenant's orchestration log.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::diagnostics::{Diagnostics, LogStream};
use crate::error::ToolError;
use crate::model::LogLevel;
use crate::tools::tool::{Tool, ToolContext, require_str};

const MAX_NOTE_CHARS: usize = 2000;

pub struct LogNoteTool {
    diagnostics: Arc<Diagnostics>,
}

impl LogNoteTool {
    pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self { diagnostics }
    }
}

#[async_trait]
impl Tool for LogNoteTool {
    fn name(&self) -> &str {
        "log_note"
    }

    fn description(&self) -> &str {
        "Record a short note about this email or conversation in the user's \
         orchestration log. Use it to leave a trail of decisions for later review."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "note": {
                    "type": "string",
                    "description": "The note to record"
                },
                "level": {
                    "type": "string",
                    "enum": ["info", "warn"],
                    "description": "Severity (default: info)"
                }
            },
            "required": ["note"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let note = require_str(self.name(), &params, "note")?.trim();
        if note.is_empty() {
            return Err(ToolError::InvalidArguments {
                name: self.name().to_string(),
                reason: "note must not be empty".into(),
            });
        }
        let note: String = note.chars().take(MAX_NOTE_CHARS).collect();
        let level = match params.get("level").and_then(|v| v.as_str()) {
            Some("warn") => LogLevel::Warn,
            _ => LogLevel::Info,
        };

        self.diagnostics
            .log
            .record(
                &ctx.tenant,
                LogStream::Orchestration,
                level,
                "note",
                note,
                Some(json!({
                    "actor_id": ctx.actor_id,
                    "role": ctx.role,
                    "thread_id": ctx.thread_id,
                })),
            )
            .await;
        Ok(json!({"recorded": true}))
    }
}
