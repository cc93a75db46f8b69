//! Email processing pipeline.
//!
//! Every tenant fetch cycle flows through:
//! 1. `TokenManager::ensure_valid()`: refresh the account's access token
//! 2. `MailProvider::fetch_unread()`: bounded unread listing
//! 3. `CompiledFilters::director_triggers()`: regex filters, deduped per director
//! 4. `ConversationEngine::run_director()`: one traced director turn per trigger

pub mod email_processor;
pub mod rules;

pub use email_processor::{AccountOutcome, CycleReport, EmailPipeline, PipelineConfig};
pub use rules::{CompiledFilters, DirectorTrigger, field_value};
