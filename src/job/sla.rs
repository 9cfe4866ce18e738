use serde::{Deserialize, Serialize};

/// Service level agreement of a job, as seen by the servers executing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSla {
    /// Jobs with a higher priority are dispatched first.
    pub priority: i32,
    /// A broadcast job is executed in full by every connected driver.
    pub broadcast: bool,
    /// The number of channels the job may execute on at the same time.
    pub max_channels: usize,
}

impl JobSla {
    pub fn new() -> Self {
        Self {
            priority: 0,
            broadcast: false,
            max_channels: usize::MAX,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels.max(1);
        self
    }
}

impl Default for JobSla {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side part of the service level agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSla {
    /// If `true`, the client walks the task graph and only dispatches tasks whose
    /// predecessors are done. Otherwise all remaining tasks are sent together and the
    /// executing side orders them.
    pub graph_traversal_in_client: bool,
    /// The number of client channels the job may execute on at the same time.
    pub max_channels: usize,
}

impl ClientSla {
    pub fn new() -> Self {
        Self {
            graph_traversal_in_client: false,
            max_channels: usize::MAX,
        }
    }

    pub fn with_graph_traversal_in_client(mut self, enabled: bool) -> Self {
        self.graph_traversal_in_client = enabled;
        self
    }

    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels.max(1);
        self
    }
}

impl Default for ClientSla {
    fn default() -> Self {
        Self::new()
    }
}
