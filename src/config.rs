//! Configuration types.
//!
//! Every component config has a `Default`; `AppConfig::from_env()` applies
//! `MAIL_DIRECTOR_*` overrides on top. Unset variables keep the default,
//! malformed ones are an error.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::diagnostics::DiagnosticsConfig;
use crate::error::ConfigError;
use crate::fetcher::{FetcherConfig, ManagerConfig};
use crate::mail::GmailConfig;
use crate::orchestrator::EngineConfig;
use crate::pipeline::PipelineConfig;
use crate::tenant::RegistryConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MAIL_DIRECTOR_";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// libSQL database file.
    pub data_path: PathBuf,
    pub listen_addr: SocketAddr,
    /// Directory for daily-rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// Base URL for the OpenAI-compatible LLM provider.
    pub openai_base_url: Option<String>,
    /// Bound on one OAuth refresh-token grant.
    pub token_refresh_timeout: Duration,
    pub registry: RegistryConfig,
    pub fetcher: FetcherConfig,
    pub manager: ManagerConfig,
    pub pipeline: PipelineConfig,
    pub engine: EngineConfig,
    pub diagnostics: DiagnosticsConfig,
    pub gmail: GmailConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data/mail-director.db"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_dir: None,
            openai_base_url: None,
            token_refresh_timeout: crate::mail::token::DEFAULT_REFRESH_TIMEOUT,
            registry: RegistryConfig::default(),
            fetcher: FetcherConfig::default(),
            manager: ManagerConfig::default(),
            pipeline: PipelineConfig::default(),
            engine: EngineConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            gmail: GmailConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(path) = env.string("DATA_PATH") {
            config.data_path = PathBuf::from(path);
        }
        config.listen_addr = env.parse("LISTEN_ADDR", config.listen_addr)?;
        config.log_dir = env.string("LOG_DIR").map(PathBuf::from);
        config.openai_base_url = env.string("OPENAI_BASE_URL");
        config.token_refresh_timeout =
            env.millis("TOKEN_REFRESH_TIMEOUT_MS", config.token_refresh_timeout)?;

        let registry = &mut config.registry;
        registry.capacity = env.parse("REGISTRY_CAPACITY", registry.capacity)?;
        registry.idle_ttl = env.secs("REGISTRY_IDLE_TTL_SECS", registry.idle_ttl)?;
        registry.sweep_interval = env.secs("REGISTRY_SWEEP_SECS", registry.sweep_interval)?;

        let fetcher = &mut config.fetcher;
        fetcher.interval = env.secs("FETCH_INTERVAL_SECS", fetcher.interval)?;
        fetcher.initial_delay = env.secs("FETCH_INITIAL_DELAY_SECS", fetcher.initial_delay)?;

        let manager = &mut config.manager;
        manager.capacity = env.parse("FETCHER_CAPACITY", manager.capacity)?;
        manager.idle_ttl = env.secs("FETCHER_IDLE_TTL_SECS", manager.idle_ttl)?;
        manager.bootstrap_concurrency =
            env.parse("BOOTSTRAP_CONCURRENCY", manager.bootstrap_concurrency)?;

        let pipeline = &mut config.pipeline;
        pipeline.list_timeout = env.millis("LIST_TIMEOUT_MS", pipeline.list_timeout)?;
        pipeline.max_messages = env.parse("FETCH_MAX_MESSAGES", pipeline.max_messages)?;

        let engine = &mut config.engine;
        engine.max_agent_steps = env.parse("MAX_AGENT_STEPS", engine.max_agent_steps)?;
        engine.step_timeout = env.millis("STEP_TIMEOUT_MS", engine.step_timeout)?;
        engine.tool_timeout = env.millis("TOOL_TIMEOUT_MS", engine.tool_timeout)?;
        engine.thread_ttl = chrono::Duration::seconds(
            env.parse("THREAD_TTL_SECS", engine.thread_ttl.num_seconds())?,
        );
        engine.default_max_tokens = env.parse("DEFAULT_MAX_TOKENS", engine.default_max_tokens)?;

        let diagnostics = &mut config.diagnostics;
        diagnostics.trace_capacity = env.parse("TRACE_CAPACITY", diagnostics.trace_capacity)?;
        diagnostics.spans_per_trace = env.parse("SPANS_PER_TRACE", diagnostics.spans_per_trace)?;
        diagnostics.payload_bytes = env.parse("PAYLOAD_BYTES", diagnostics.payload_bytes)?;
        diagnostics.log_capacity = env.parse("LOG_CAPACITY", diagnostics.log_capacity)?;
        if let Some(keys) = env.string("REDACT_KEYS") {
            diagnostics.redact_keys.extend(
                keys.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            );
        }

        let gmail = &mut config.gmail;
        if let Some(id) = env.string("GMAIL_CLIENT_ID") {
            gmail.client_id = SecretString::from(id);
        }
        if let Some(secret) = env.string("GMAIL_CLIENT_SECRET") {
            gmail.client_secret = SecretString::from(secret);
        }
        if let Some(url) = env.string("GMAIL_TOKEN_URL") {
            gmail.token_url = url;
        }
        if let Some(base) = env.string("GMAIL_API_BASE") {
            gmail.api_base = base;
        }

        if config.engine.max_agent_steps == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}MAX_AGENT_STEPS"),
                message: "must be at least 1".into(),
            });
        }
        Ok(config)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                message: format!("{raw:?}: {e}"),
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}
