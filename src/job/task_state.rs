use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Terminal state of a task which returned from execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Result,
    Exception,
}

impl TaskState {
    fn index(self) -> usize {
        match self {
            TaskState::Result => 0,
            TaskState::Exception => 1,
        }
    }
}

/// Maps task positions to their terminal state and keeps a live count per state,
/// so that `count(state)` is always the number of positions in that state.
#[derive(Debug, Default, Clone)]
pub struct TaskStateMap {
    states: HashMap<usize, TaskState>,
    counts: [usize; 2],
}

impl TaskStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `state` for `position` and returns the previous state, if any.
    pub fn put(&mut self, position: usize, state: TaskState) -> Option<TaskState> {
        let previous = self.states.insert(position, state);
        if let Some(old) = previous {
            self.counts[old.index()] -= 1;
        }
        self.counts[state.index()] += 1;
        previous
    }

    pub fn get(&self, position: usize) -> Option<TaskState> {
        self.states.get(&position).copied()
    }

    pub fn remove(&mut self, position: usize) -> Option<TaskState> {
        let removed = self.states.remove(&position);
        if let Some(old) = removed {
            self.counts[old.index()] -= 1;
        }
        removed
    }

    pub fn contains(&self, position: usize) -> bool {
        self.states.contains_key(&position)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.counts[state.index()]
    }

    /// Number of positions with a terminal state.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.counts = [0; 2];
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, TaskState)> + '_ {
        self.states
            .iter()
            .map(|(position, state)| (*position, *state))
    }
}
