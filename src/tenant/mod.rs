//! Tenant identity and the per-tenant resource registry.

pub mod registry;

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::TenantError;

pub use registry::{RegistryConfig, ResourceBundle, ResourceRegistry};

/// Maximum tenant id length.
pub const MAX_TENANT_ID_LEN: usize = 64;

static TENANT_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("tenant id pattern compiles")
});

/// Validated tenant id. The only way to build one is `TenantId::parse`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Validate a raw uid.
    pub fn parse(raw: &str) -> Result<Self, TenantError> {
        if raw.is_empty() {
            return Err(TenantError::Invalid {
                uid: String::new(),
                reason: "empty",
            });
        }
        if raw.len() > MAX_TENANT_ID_LEN {
            return Err(TenantError::Invalid {
                uid: raw.chars().take(MAX_TENANT_ID_LEN).collect(),
                reason: "too long",
            });
        }
        if !TENANT_ID_PATTERN.is_match(raw) {
            return Err(TenantError::Invalid {
                uid: raw.to_string(),
                reason: "contains characters outside [A-Za-z0-9_-]",
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        TenantId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Immutable per-call tenant context, passed by parameter through the
/// pipeline, the engine and tool handlers.
#[derive(Clone)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub bundle: Arc<ResourceBundle>,
}

impl TenantContext {
    pub fn new(bundle: Arc<ResourceBundle>) -> Self {
        Self {
            tenant_id: bundle.tenant_id.clone(),
            bundle,
        }
    }
}

impl fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantContext")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}
