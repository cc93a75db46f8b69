//! Director/agent orchestration.
//!
//! A matched email starts a director thread; directors may delegate to
//! agents through synthesized `agent__<id>` tools, and agents run a bounded
//! tool-call loop in threads of their own.

pub mod engine;
pub mod policy;
pub mod threads;

pub use engine::{
    AgentRun, AgentStep, ConversationEngine, DirectorOutcome, EngineConfig, EngineDeps, StepOutcome,
};
pub use policy::{DirectorTurn, FinalizationPolicy, FinalizeUnlessDelegated};
