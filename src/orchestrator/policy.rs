//! When a director thread is closed.

/// Summary of one director turn handed to the finalization policy.
#[derive(Debug, Clone, Default)]
pub struct DirectorTurn {
    /// Tool calls the model requested (agent delegations included).
    pub tool_calls: usize,
    /// Agent delegations among them.
    pub delegations: usize,
    /// Whether the model produced any text.
    pub has_text: bool,
}

/// Decides whether a director thread is finalized after a turn.
pub trait FinalizationPolicy: Send + Sync {
    fn should_finalize(&self, turn: &DirectorTurn) -> bool;
}

/// Finalize after the turn unless the director delegated to an agent, in
/// which case the thread stays open for follow-up steps.
#[derive(Debug, Default, Clone, Copy)]
pub struct FinalizeUnlessDelegated;

impl FinalizationPolicy for FinalizeUnlessDelegated {
    fn should_finalize(&self, turn: &DirectorTurn) -> bool {
        turn.delegations == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegation_keeps_thread_open() {
        let policy = FinalizeUnlessDelegated;
        assert!(policy.should_finalize(&DirectorTurn::default()));
        assert!(policy.should_finalize(&DirectorTurn {
            tool_calls: 2,
            delegations: 0,
            has_text: true,
        }));
        assert!(!policy.should_finalize(&DirectorTurn {
            tool_calls: 1,
            delegations: 1,
            has_text: false,
        }));
    }
}
