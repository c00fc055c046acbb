//! Transition table for the primary pipeline state.

use crate::core::PipelineState;
use std::collections::{HashMap, HashSet};

/// The set of legal `(from, to)` state pairs.
///
/// Lookups are O(1). The default table models a linear run:
///
/// ```text
/// IDLE -> ANALYZING -> PLANNING -> STAGE_RUNNING <-> STAGE_COMPLETED -> COMPLETED
///                                        |
///                                   STAGE_FAILED -> RECOVERING -> STAGE_RUNNING
///                                        |
///                                      FAILED -> RECOVERING (resume)
/// ```
///
/// Every non-terminal state may move to ABORTED, and every state a crashed
/// process can be found in may move to RECOVERING on resume.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    edges: HashMap<PipelineState, HashSet<PipelineState>>,
}

impl Default for TransitionTable {
    fn default() -> Self {
        use PipelineState::{
            Aborted, Analyzing, Completed, Failed, Idle, Planning, Recovering, StageCompleted,
            StageFailed, StageRunning,
        };

        Self::empty()
            .with_edges(Idle, &[Analyzing, Planning, StageRunning, Aborted])
            .with_edges(Analyzing, &[Planning, Recovering, Failed, Aborted])
            .with_edges(Planning, &[StageRunning, Completed, Recovering, Failed, Aborted])
            .with_edges(StageRunning, &[StageCompleted, StageFailed, Recovering, Aborted])
            .with_edges(StageCompleted, &[StageRunning, Completed, Recovering, Aborted])
            .with_edges(StageFailed, &[Recovering, Failed, Aborted])
            .with_edges(Recovering, &[StageRunning, Completed, Failed, Aborted])
            .with_edges(Failed, &[Recovering])
    }
}

impl TransitionTable {
    /// Creates a table with no legal transitions.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            edges: HashMap::new(),
        }
    }

    /// Adds one legal transition.
    #[must_use]
    pub fn with_edge(mut self, from: PipelineState, to: PipelineState) -> Self {
        self.edges.entry(from).or_default().insert(to);
        self
    }

    /// Adds several legal transitions from one state.
    #[must_use]
    pub fn with_edges(mut self, from: PipelineState, targets: &[PipelineState]) -> Self {
        self.edges.entry(from).or_default().extend(targets.iter().copied());
        self
    }

    /// Removes a transition.
    #[must_use]
    pub fn without_edge(mut self, from: PipelineState, to: PipelineState) -> Self {
        if let Some(targets) = self.edges.get_mut(&from) {
            targets.remove(&to);
        }
        self
    }

    /// Returns true if `from -> to` is legal.
    #[must_use]
    pub fn allows(&self, from: PipelineState, to: PipelineState) -> bool {
        self.edges.get(&from).is_some_and(|targets| targets.contains(&to))
    }

    /// Returns the states reachable from `from`, sorted.
    #[must_use]
    pub fn allowed_from(&self, from: PipelineState) -> Vec<PipelineState> {
        let mut targets: Vec<_> = self
            .edges
            .get(&from)
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default();
        targets.sort();
        targets
    }

    /// Number of legal transitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.values().map(HashSet::len).sum()
    }

    /// Returns true if no transitions are legal.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_default_table_linear_path() {
        let table = TransitionTable::default();
        let path = [
            Idle,
            Analyzing,
            Planning,
            StageRunning,
            StageCompleted,
            StageRunning,
            StageCompleted,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(table.allows(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states_have_few_exits() {
        let table = TransitionTable::default();
        assert!(table.allowed_from(Completed).is_empty());
        assert!(table.allowed_from(Aborted).is_empty());
        assert_eq!(table.allowed_from(Failed), vec![Recovering]);
    }

    #[test]
    fn test_every_non_terminal_state_can_abort() {
        let table = TransitionTable::default();
        for state in PipelineState::ALL {
            if !state.is_terminal() {
                assert!(table.allows(state, Aborted), "{state} cannot abort");
            }
        }
    }

    #[test]
    fn test_self_loops_are_illegal() {
        let table = TransitionTable::default();
        for state in PipelineState::ALL {
            assert!(!table.allows(state, state));
        }
    }

    #[test]
    fn test_custom_edges() {
        let table = TransitionTable::empty()
            .with_edge(Idle, Completed)
            .with_edges(Idle, &[Aborted]);
        assert_eq!(table.len(), 2);
        assert!(table.allows(Idle, Completed));

        let table = table.without_edge(Idle, Completed);
        assert!(!table.allows(Idle, Completed));
        assert_eq!(table.allowed_from(Idle), vec![Aborted]);
        assert!(!TransitionTable::default().is_empty());
    }
}
