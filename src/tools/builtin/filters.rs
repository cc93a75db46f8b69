//! Read-only view of the tenant's routing filters, for directors.

use async_trait::async_trait;
use serde_json::json;

use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolCapabilities, ToolContext};

pub struct ListFiltersTool;

#[async_trait]
impl Tool for ListFiltersTool {
    fn name(&self) -> &str {
        "list_filters"
    }

    fn description(&self) -> &str {
        "List the user's enabled email filters: which field each one matches, \
         its pattern, and the director it routes to."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}})
    }

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities::default_enabled().director_only()
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let filters = ctx
            .tenant
            .bundle
            .filters
            .get_all()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })?;
        let listed: Vec<_> = filters
            .iter()
            .filter(|f| f.enabled)
            .map(|f| {
                json!({
                    "id": f.id,
                    "field": f.field,
                    "regex": f.regex,
                    "director_id": f.director_id,
                    "duplicate_allowed": f.duplicate_allowed,
                })
            })
            .collect();
        Ok(json!({ "filters": listed }))
    }
}
