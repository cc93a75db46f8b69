//! Mail Director: multi-tenant email triage core.
//!
//! Per-tenant fetch loops pull unread mail, match it against user filters,
//! and hand each match to an LLM director that may delegate to agents.

pub mod api;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fetcher;
pub mod llm;
pub mod mail;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod store;
pub mod tenant;
pub mod tools;
