//! Mail providers and OAuth token management.

pub mod gmail;
pub mod provider;
pub mod token;

pub use gmail::{GmailConfig, GmailProvider};
pub use provider::{FetchOptions, MailProvider, ProviderRegistry, RefreshedToken};
pub use token::{EnsuredCredential, TokenManager, classify_refresh_failure, persist_credential};
