use std::{error::Error, fmt, io, time::Duration};

use crate::communication::CommunicationError;

/// Exception raised by a single task. It is carried as the task's result and never
/// fails the job by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task body returned an error.
    Failed(String),
    /// The task did not finish within its timeout.
    Timeout(Duration),
    /// The task body panicked.
    Panicked(String),
    /// The task could not be serialized for a remote dispatch.
    NotSerializable(String),
    /// The unit carrying the task failed as a whole.
    Dispatch(String),
    /// The task was skipped because its unit was cancelled.
    Cancelled,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed(msg) => write!(f, "task failed: {}", msg),
            TaskError::Timeout(timeout) => write!(f, "task timed out after {:?}", timeout),
            TaskError::Panicked(msg) => write!(f, "task panicked: {}", msg),
            TaskError::NotSerializable(msg) => write!(f, "task not serializable: {}", msg),
            TaskError::Dispatch(msg) => write!(f, "dispatch failed: {}", msg),
            TaskError::Cancelled => write!(f, "task cancelled"),
        }
    }
}

impl Error for TaskError {}

impl From<&DispatchError> for TaskError {
    fn from(e: &DispatchError) -> Self {
        match e {
            DispatchError::Communication(CommunicationError::NotSerializable(msg)) => {
                TaskError::NotSerializable(msg.clone())
            }
            other => TaskError::Dispatch(other.to_string()),
        }
    }
}

/// Error ending a whole [`DispatchUnit`](crate::job::DispatchUnit), handed to
/// [`Job::task_completed`](crate::job::Job::task_completed).
#[derive(Debug)]
pub enum DispatchError {
    /// The remote round trip failed.
    Communication(CommunicationError),
    /// Local execution failed outside of the tasks themselves.
    Execution(String),
}

impl DispatchError {
    /// Serialization failures leave the job's results usable.
    pub fn is_serialization(&self) -> bool {
        match self {
            DispatchError::Communication(e) => e.is_serialization(),
            DispatchError::Execution(_) => false,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Communication(e) => write!(f, "{}", e),
            DispatchError::Execution(msg) => write!(f, "execution failed: {}", msg),
        }
    }
}

impl Error for DispatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DispatchError::Communication(e) => Some(e),
            DispatchError::Execution(_) => None,
        }
    }
}

impl From<CommunicationError> for DispatchError {
    fn from(e: CommunicationError) -> Self {
        DispatchError::Communication(e)
    }
}

/// Error raised when a job cannot be submitted.
#[derive(Debug)]
pub enum JobError {
    /// The job has no tasks.
    EmptyJob,
    /// A dependency refers to a position with no task.
    UnknownTask(usize),
    /// The declared dependencies contain a cycle.
    CyclicDependency,
    /// The manager has been closed.
    Closed,
    /// The dispatch runtime could not be started.
    Runtime(io::Error),
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::EmptyJob => write!(f, "the job has no tasks"),
            JobError::UnknownTask(position) => write!(f, "no task at position {}", position),
            JobError::CyclicDependency => write!(f, "the task dependencies contain a cycle"),
            JobError::Closed => write!(f, "the dispatch manager is closed"),
            JobError::Runtime(e) => write!(f, "failed to start the dispatch runtime: {}", e),
        }
    }
}

impl Error for JobError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            JobError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for JobError {
    fn from(e: io::Error) -> Self {
        JobError::Runtime(e)
    }
}
