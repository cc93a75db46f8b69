//! Mail accounts and their OAuth credential.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OAuth credential of a mail account.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// A connected mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailAccount {
    pub id: String,
    /// Provider id resolved through the mail `ProviderRegistry` (e.g. "gmail").
    pub provider: String,
    pub email: String,
    #[serde(default)]
    pub credential: Credential,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl MailAccount {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            email: email.into(),
            credential: Credential::default(),
            enabled: true,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }
}
