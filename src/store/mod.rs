//! Persistence layer: per-tenant JSON collections behind a backend trait.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{CollectionStore, Repository};

/// Collection names used by a tenant bundle.
pub mod collections {
    pub const ACCOUNTS: &str = "accounts";
    pub const SETTINGS: &str = "settings";
    pub const FILTERS: &str = "filters";
    pub const DIRECTORS: &str = "directors";
    pub const AGENTS: &str = "agents";
    pub const PROMPTS: &str = "prompts";
    pub const API_CONFIGS: &str = "api_configs";
    pub const CONVERSATIONS: &str = "conversations";
    pub const PROCESSED_MESSAGES: &str = "processed_messages";
    pub const FETCHER_LOG: &str = "fetcher_log";
    pub const ORCHESTRATION_LOG: &str = "orchestration_log";
    pub const PROVIDER_EVENTS: &str = "provider_events";
    pub const TRACES: &str = "traces";

    /// Every collection pre-created when a tenant is first materialized.
    pub const ALL: &[&str] = &[
        ACCOUNTS,
        SETTINGS,
        FILTERS,
        DIRECTORS,
        AGENTS,
        PROMPTS,
        API_CONFIGS,
        CONVERSATIONS,
        PROCESSED_MESSAGES,
        FETCHER_LOG,
        ORCHESTRATION_LOG,
        PROVIDER_EVENTS,
        TRACES,
    ];
}
