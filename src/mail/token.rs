//! OAuth access-token refresh, run ahead of every provider call.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::clock::Clock;
use crate::diagnostics::{Diagnostics, LogStream};
use crate::error::{ProviderError, StorageError, TokenError};
use crate::mail::provider::ProviderRegistry;
use crate::model::{Credential, LogLevel, MailAccount};
use crate::tenant::TenantContext;

/// Tokens expiring within this window are refreshed early.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 120;

/// Upper bound on one refresh-token grant.
pub const DEFAULT_REFRESH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// A usable access token plus whether it was just refreshed.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsuredCredential {
    pub access_token: String,
    pub expiry: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
    /// True when a refresh happened and the caller should persist.
    pub updated: bool,
}

impl EnsuredCredential {
    pub fn to_credential(&self) -> Credential {
        Credential {
            access_token: Some(self.access_token.clone()),
            refresh_token: self.refresh_token.clone(),
            expiry: self.expiry,
        }
    }
}

/// Map a provider failure from the refresh grant onto a token error.
pub fn classify_refresh_failure(account_id: &str, error: &ProviderError) -> TokenError {
    let account_id = account_id.to_string();
    match error {
        ProviderError::MissingRefreshToken => TokenError::MissingRefreshToken { account_id },
        ProviderError::Http { status, body }
            if body.contains("invalid_grant") || (*status == 400 && body.contains("revoked")) =>
        {
            TokenError::InvalidGrant {
                account_id,
                reason: body.clone(),
            }
        }
        ProviderError::Network(reason) => TokenError::Network {
            account_id,
            reason: reason.clone(),
        },
        ProviderError::Timeout { .. } => TokenError::Network {
            account_id,
            reason: error.to_string(),
        },
        other => TokenError::Other {
            account_id,
            reason: other.to_string(),
        },
    }
}

pub struct TokenManager {
    providers: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<Diagnostics>,
    margin: Duration,
    refresh_timeout: std::time::Duration,
}

impl TokenManager {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            providers,
            clock,
            diagnostics,
            margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    pub fn with_refresh_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Whether the credential must be refreshed before use.
    pub fn needs_refresh(&self, credential: &Credential) -> bool {
        let has_token = credential
            .access_token
            .as_deref()
            .is_some_and(|t| !t.is_empty());
        match (has_token, credential.expiry) {
            (true, Some(expiry)) => expiry <= self.clock.now() + self.margin,
            _ => true,
        }
    }

    /// Return a valid access token for `account`, refreshing if needed.
    pub async fn ensure_valid(
        &self,
        ctx: &TenantContext,
        account: &MailAccount,
    ) -> Result<EnsuredCredential, TokenError> {
        let credential = &account.credential;
        if !self.needs_refresh(credential) {
            return Ok(EnsuredCredential {
                access_token: credential.access_token.clone().unwrap_or_default(),
                expiry: credential.expiry,
                refresh_token: credential.refresh_token.clone(),
                updated: false,
            });
        }

        let Some(refresh_token) = credential
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
        else {
            let err = TokenError::MissingRefreshToken {
                account_id: account.id.clone(),
            };
            self.record(ctx, account, Err(&err)).await;
            return Err(err);
        };

        let provider = match self.providers.get(&account.provider) {
            Ok(provider) => provider,
            Err(e) => {
                let err = TokenError::Other {
                    account_id: account.id.clone(),
                    reason: e.to_string(),
                };
                self.record(ctx, account, Err(&err)).await;
                return Err(err);
            }
        };

        let refreshed = tokio::time::timeout(
            self.refresh_timeout,
            provider.refresh_access_token(account),
        )
        .await
        .unwrap_or_else(|_| Err(ProviderError::timeout("token_refresh", self.refresh_timeout)));

        match refreshed {
            Ok(refreshed) => {
                let now = self.clock.now();
                let ensured = EnsuredCredential {
                    access_token: refreshed.access_token,
                    expiry: refreshed.expires_in_secs.map(|secs| now + Duration::seconds(secs)),
                    refresh_token: refreshed
                        .refresh_token
                        .or_else(|| Some(refresh_token.to_string())),
                    updated: true,
                };
                self.record(ctx, account, Ok(&ensured)).await;
                Ok(ensured)
            }
            Err(e) => {
                let err = classify_refresh_failure(&account.id, &e);
                self.record(ctx, account, Err(&err)).await;
                Err(err)
            }
        }
    }

    async fn record(
        &self,
        ctx: &TenantContext,
        account: &MailAccount,
        outcome: Result<&EnsuredCredential, &TokenError>,
    ) {
        let log = &self.diagnostics.log;
        match outcome {
            Ok(ensured) => {
                log.record(
                    ctx,
                    LogStream::ProviderEvents,
                    LogLevel::Info,
                    "token_refresh",
                    format!("Refreshed access token for {}", account.email),
                    Some(json!({
                        "account_id": account.id,
                        "provider": account.provider,
                        "expiry": ensured.expiry,
                    })),
                )
                .await
            }
            Err(err) => {
                log.record(
                    ctx,
                    LogStream::ProviderEvents,
                    LogLevel::Warn,
                    "token_refresh_failed",
                    err.to_string(),
                    Some(json!({
                        "account_id": account.id,
                        "provider": account.provider,
                        "kind": err.kind(),
                        "requires_reauthorization": err.requires_reauthorization(),
                    })),
                )
                .await
            }
        }
    }
}

/// Replace the stored account record with `account` carrying the refreshed
/// credential. Returns false if the account no longer exists.
pub async fn persist_credential(
    ctx: &TenantContext,
    account: &MailAccount,
    ensured: &EnsuredCredential,
) -> Result<bool, StorageError> {
    let updated = account.clone().with_credential(ensured.to_credential());
    ctx.bundle
        .accounts
        .update(move |accounts| match accounts.iter_mut().find(|a| a.id == updated.id) {
            Some(slot) => {
                *slot = updated;
                true
            }
            None => false,
        })
        .await
}
