//! Per-tenant settings, stored as a single-record collection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSettings {
    /// Persisted intent to run the fetch loop; drives bootstrap on restart.
    #[serde(default)]
    pub fetcher_auto_start: bool,
    /// Overrides the pipeline's default page size for unread listing.
    #[serde(default)]
    pub fetch_max_messages: Option<usize>,
    #[serde(default = "default_true")]
    pub unread_only: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            fetcher_auto_start: false,
            fetch_max_messages: None,
            unread_only: true,
        }
    }
}
