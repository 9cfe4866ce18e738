use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{errors::TaskError, task_state::TaskState};

/// The code executed by a [`Task`].
///
/// Closures of the form `Fn(&TaskContext) -> Result<Bytes, TaskError>` implement this
/// trait.
pub trait TaskBody: Send + Sync {
    fn run(&self, context: &TaskContext) -> Result<Bytes, TaskError>;

    /// Whether the body can be shipped to a remote server. Bodies that cannot are
    /// resolved locally as [`TaskError::NotSerializable`] on remote channels.
    fn is_serializable(&self) -> bool {
        true
    }
}

impl<F> TaskBody for F
where
    F: Fn(&TaskContext) -> Result<Bytes, TaskError> + Send + Sync,
{
    fn run(&self, context: &TaskContext) -> Result<Bytes, TaskError> {
        (self)(context)
    }
}

/// Names the code base a task needs on the executing side. Remote channels register
/// every distinct code base of a unit before dispatching it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Codebase(String);

impl Codebase {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Codebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only data shared by all the tasks of a job.
#[derive(Debug, Clone, Default)]
pub struct DataProvider {
    values: HashMap<String, Bytes>,
}

impl DataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: &str, value: Bytes) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Context handed to a [`TaskBody`] when it runs.
#[derive(Clone)]
pub struct TaskContext {
    job_uuid: Uuid,
    position: usize,
    data_provider: Option<Arc<DataProvider>>,
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new(
        job_uuid: Uuid,
        position: usize,
        data_provider: Option<Arc<DataProvider>>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            job_uuid,
            position,
            data_provider,
            cancelled,
        }
    }

    pub fn job_uuid(&self) -> Uuid {
        self.job_uuid
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn data_provider(&self) -> Option<&DataProvider> {
        self.data_provider.as_deref()
    }

    /// Long-running bodies should poll this flag and return early once it is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A unit of work within a job. The position is assigned on submission and
/// identifies the task for its whole life, across every copy made for dispatch.
#[derive(Clone)]
pub struct Task {
    position: usize,
    id: Option<String>,
    body: Arc<dyn TaskBody>,
    codebase: Option<Codebase>,
    timeout: Option<Duration>,
}

impl Task {
    pub fn new<B: TaskBody + 'static>(body: B) -> Self {
        Self::from_body(Arc::new(body))
    }

    pub fn from_body(body: Arc<dyn TaskBody>) -> Self {
        Self {
            position: 0,
            id: None,
            body,
            codebase: None,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_codebase(mut self, codebase: Codebase) -> Self {
        self.codebase = Some(codebase);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn body(&self) -> &Arc<dyn TaskBody> {
        &self.body
    }

    pub fn codebase(&self) -> Option<&Codebase> {
        self.codebase.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_serializable(&self) -> bool {
        self.body.is_serializable()
    }

    /// Runs the body on the current thread. Errors and panics become exceptions.
    pub fn execute(&self, context: &TaskContext) -> TaskResult {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.body.run(context)));
        match outcome {
            Ok(Ok(data)) => TaskResult::result(self.position, data),
            Ok(Err(e)) => TaskResult::exception(self.position, e),
            Err(payload) => {
                let message = if let Some(message) = payload.downcast_ref::<&str>() {
                    message.to_string()
                } else if let Some(message) = payload.downcast_ref::<String>() {
                    message.clone()
                } else {
                    "unknown panic".to_string()
                };
                TaskResult::exception(self.position, TaskError::Panicked(message))
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("position", &self.position)
            .field("id", &self.id)
            .field("codebase", &self.codebase)
            .finish()
    }
}

/// What a task produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Result(Bytes),
    Exception(TaskError),
    /// Synthetic completion of a task that never ran to the end, e.g. after a cancel.
    Empty,
}

/// The outcome of the task at `position`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub position: usize,
    pub outcome: TaskOutcome,
}

impl TaskResult {
    pub fn result(position: usize, data: Bytes) -> Self {
        Self {
            position,
            outcome: TaskOutcome::Result(data),
        }
    }

    pub fn exception(position: usize, error: TaskError) -> Self {
        Self {
            position,
            outcome: TaskOutcome::Exception(error),
        }
    }

    pub fn empty(position: usize) -> Self {
        Self {
            position,
            outcome: TaskOutcome::Empty,
        }
    }

    /// The terminal state recorded for this result.
    pub fn state(&self) -> TaskState {
        match self.outcome {
            TaskOutcome::Exception(_) => TaskState::Exception,
            _ => TaskState::Result,
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        match &self.outcome {
            TaskOutcome::Result(data) => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match &self.outcome {
            TaskOutcome::Exception(e) => Some(e),
            _ => None,
        }
    }
}
