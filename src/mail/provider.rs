//! Mail provider contract.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::model::{Envelope, MailAccount};

/// Result of an OAuth refresh-token grant.
#[derive(Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Lifetime of the new access token, when the provider reports one.
    pub expires_in_secs: Option<i64>,
    /// Rotated refresh token, if the provider issued a new one.
    pub refresh_token: Option<String>,
}

impl fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("expires_in_secs", &self.expires_in_secs)
            .field("rotated", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Unread listing parameters.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub max: usize,
    pub unread_only: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max: 25,
            unread_only: true,
        }
    }
}

/// A mailbox backend (Gmail, ...).
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Provider id matched against `MailAccount::provider`.
    fn id(&self) -> &str;

    /// Exchange the account's refresh token for a new access token.
    async fn refresh_access_token(
        &self,
        account: &MailAccount,
    ) -> Result<RefreshedToken, ProviderError>;

    /// List messages, newest first, capped at `options.max`.
    async fn fetch_unread(
        &self,
        account: &MailAccount,
        access_token: &str,
        options: &FetchOptions,
    ) -> Result<Vec<Envelope>, ProviderError>;
}

/// Mail providers keyed by provider id.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn MailProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn MailProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn MailProvider>) {
        let id = provider.id().to_string();
        tracing::debug!(provider = %id, "Registered mail provider");
        self.providers.insert(id, provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn MailProvider>, ProviderError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(id.to_string()))
    }
}
