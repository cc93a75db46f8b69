//! Built-in tools: current time, orchestration notes and filter listing.

pub mod filters;
pub mod notes;
pub mod time;

use std::sync::Arc;

pub use filters::ListFiltersTool;
pub use notes::LogNoteTool;
pub use time::CurrentTimeTool;

use crate::clock::Clock;
use crate::diagnostics::Diagnostics;
use crate::tools::ToolRegistry;

/// Register every built-in tool.
pub fn register_builtins(
    registry: &ToolRegistry,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<Diagnostics>,
) {
    registry.register_sync(Arc::new(CurrentTimeTool::new(clock)));
    registry.register_sync(Arc::new(LogNoteTool::new(diagnostics)));
    registry.register_sync(Arc::new(ListFiltersTool));
}
