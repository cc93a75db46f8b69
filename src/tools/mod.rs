//! Tool abstraction for director and agent capabilities.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::{AGENT_TOOL_PREFIX, ToolRegistry};
pub use tool::*;
