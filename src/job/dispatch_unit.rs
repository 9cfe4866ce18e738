use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use uuid::Uuid;

use crate::{ChannelId, UnitId};

use super::{
    errors::{DispatchError, TaskError},
    sla::JobSla,
    task::{Codebase, DataProvider, Task, TaskContext, TaskResult},
    task_graph::TaskGraph,
    Job,
};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// A group of tasks carved out of a [`Job`] for one dispatch to one channel.
///
/// The task list never changes once the unit is built. The `cancelled` and `requeued`
/// flags are set at most once and never reset. Every change to the job goes through
/// the unit's callbacks, and [`DispatchUnit::task_completed`] only reaches the job
/// the first time it is called.
pub struct DispatchUnit {
    id: UnitId,
    job: Arc<Job>,
    tasks: Vec<Task>,
    graph: Option<TaskGraph>,
    sla: JobSla,
    data_provider: Option<Arc<DataProvider>>,
    cancelled: Arc<AtomicBool>,
    requeued: AtomicBool,
    completed: AtomicBool,
    created: Instant,
}

impl DispatchUnit {
    pub(crate) fn new(job: Arc<Job>, tasks: Vec<Task>, graph: Option<TaskGraph>) -> Self {
        let sla = job.sla().clone();
        let data_provider = job.data_provider();
        Self {
            id: NEXT_UNIT_ID.fetch_add(1, Ordering::SeqCst),
            job,
            tasks,
            graph,
            sla,
            data_provider,
            cancelled: Arc::new(AtomicBool::new(false)),
            requeued: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn job_uuid(&self) -> Uuid {
        self.job.uuid()
    }

    pub fn job_name(&self) -> &str {
        self.job.name()
    }

    pub fn sla(&self) -> &JobSla {
        &self.sla
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn positions(&self) -> Vec<usize> {
        self.tasks.iter().map(|task| task.position()).collect()
    }

    /// Dependencies the executing side has to honour between the tasks of this unit.
    pub fn graph(&self) -> Option<&TaskGraph> {
        self.graph.as_ref()
    }

    pub fn data_provider(&self) -> Option<Arc<DataProvider>> {
        self.data_provider.clone()
    }

    /// The distinct code bases required by the tasks of this unit.
    pub fn codebases(&self) -> BTreeSet<Codebase> {
        self.tasks
            .iter()
            .filter_map(|task| task.codebase().cloned())
            .collect()
    }

    /// Builds the context a task of this unit runs with.
    pub fn task_context(&self, task: &Task) -> TaskContext {
        TaskContext::new(
            self.job.uuid(),
            task.position(),
            self.data_provider.clone(),
            Arc::clone(&self.cancelled),
        )
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Flags the unit as cancelled. Returns `false` if it already was.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_requeued(&self) -> bool {
        self.requeued.load(Ordering::SeqCst)
    }

    /// Flags the unit for resubmission. Returns `false` if it already was flagged or if
    /// it has already completed, in which case the caller must not complete it again.
    pub fn resubmit(&self) -> bool {
        if self.is_completed() {
            return false;
        }
        !self.requeued.swap(true, Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Registers the unit as executing on `channel`.
    pub fn job_dispatched(self: &Arc<Self>, channel: ChannelId) {
        let job = Arc::clone(&self.job);
        job.job_dispatched(self, channel);
    }

    /// Delivers results for tasks of this unit.
    pub fn results_received(&self, results: Vec<TaskResult>) {
        if !results.is_empty() {
            self.job.results_received(results);
        }
    }

    /// Delivers `error` as the exception of every task of this unit without a result.
    pub fn results_received_error(&self, error: &DispatchError) {
        let unresolved = self.job.unresolved_positions(&self.positions());
        let results = unresolved
            .into_iter()
            .map(|position| TaskResult::exception(position, TaskError::from(error)))
            .collect();
        self.results_received(results);
    }

    /// Ends the unit. Only the first call reaches the job; returns whether this call
    /// was that one.
    pub fn task_completed(&self, error: Option<&DispatchError>) -> bool {
        if self.completed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.job.task_completed(self, error);
        true
    }
}

impl fmt::Debug for DispatchUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchUnit")
            .field("id", &self.id)
            .field("job", &self.job.uuid())
            .field("positions", &self.positions())
            .field("cancelled", &self.is_cancelled())
            .field("requeued", &self.is_requeued())
            .finish()
    }
}
