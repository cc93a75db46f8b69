//! Tenant-scoped records persisted in the bundle repositories.

pub mod account;
pub mod actor;
pub mod conversation;
pub mod envelope;
pub mod filter;
pub mod log;
pub mod settings;

pub use account::{Credential, MailAccount};
pub use actor::{Agent, ApiConfig, Director, Prompt};
pub use conversation::{ConversationThread, ThreadKind, ThreadStatus};
pub use envelope::Envelope;
pub use filter::{Filter, FilterField};
pub use log::{LogEntry, LogLevel, ProcessedMessage};
pub use settings::TenantSettings;
