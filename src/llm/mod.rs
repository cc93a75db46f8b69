//! LLM integration.
//!
//! Providers implement `LlmProvider` and are looked up by the provider id
//! named in an `ApiConfig`. One OpenAI-compatible provider ships in-tree.

pub mod openai;
pub mod provider;

pub use openai::OpenAiCompatibleProvider;
pub use provider::*;
