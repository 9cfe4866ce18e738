//! Jobs, their tasks, and the units carved out of them for dispatch.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    channel::{Channel, ChannelRegistry},
    ChannelId, UnitId,
};

// Private submodules
mod dispatch_unit;
mod errors;
mod listener;
mod sla;
mod submission;
mod task;
mod task_graph;
mod task_state;

// Public exports
pub use dispatch_unit::DispatchUnit;
pub use errors::{DispatchError, JobError, TaskError};
pub use listener::{JobEvent, JobListener, SubmissionStatus};
pub use sla::{ClientSla, JobSla};
pub use submission::JobSubmission;
pub use task::{
    Codebase, DataProvider, Task, TaskBody, TaskContext, TaskOutcome, TaskResult,
};
pub use task_graph::TaskGraph;
pub use task_state::{TaskState, TaskStateMap};

/// Lifecycle of a [`Job`]. Cancellation is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    New,
    Executing,
    Done,
}

type RequeueCallback = Arc<dyn Fn(&Arc<Job>) + Send + Sync>;
type DoneHook = Box<dyn FnOnce(&Job) + Send>;

/// Tasks of the job, guarded by the task lock.
struct TaskBook {
    /// Tasks neither dispatched nor resulted, by position.
    pending: BTreeMap<usize, Task>,
    /// Graph positions handed out but not resulted yet.
    dispatched: BTreeSet<usize>,
    graph: Option<TaskGraph>,
    states: TaskStateMap,
    results: BTreeMap<usize, TaskResult>,
}

struct InFlight {
    unit: Weak<DispatchUnit>,
    channel: ChannelId,
}

/// Dispatch bookkeeping, guarded by the dispatch lock.
#[derive(Default)]
struct DispatchBook {
    in_flight: HashMap<UnitId, InFlight>,
    children: HashMap<Uuid, Arc<Job>>,
    cancelled_drivers: HashSet<Uuid>,
}

struct JobState {
    status: JobStatus,
    submission: SubmissionStatus,
    failed: bool,
}

#[derive(Default)]
struct JobHooks {
    on_requeue: Option<RequeueCallback>,
    on_done: Vec<DoneHook>,
}

/// The authoritative state machine of one submitted job.
///
/// The job owns every task which is not dispatched yet, tracks the units executing
/// somewhere, aggregates their results, and decides when it is done. The task
/// bookkeeping and the dispatch bookkeeping sit behind two separate locks and are
/// never held while calling into a channel or a listener.
pub struct Job {
    uuid: Uuid,
    name: String,
    sla: JobSla,
    client_sla: ClientSla,
    data_provider: Option<Arc<DataProvider>>,
    task_count: usize,
    tasks: Mutex<TaskBook>,
    dispatch: Mutex<DispatchBook>,
    state: Mutex<JobState>,
    completion: Condvar,
    cancelled: AtomicBool,
    done: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn JobListener>>>,
    hooks: Mutex<JobHooks>,
    parent: Option<Weak<Job>>,
    broadcast_target: Option<Uuid>,
    channels: OnceCell<Weak<ChannelRegistry>>,
}

impl Job {
    /// Validates a submission and builds the job.
    pub fn from_submission(submission: JobSubmission) -> Result<Arc<Job>, JobError> {
        let task_count = submission.tasks.len();
        if task_count == 0 {
            return Err(JobError::EmptyJob);
        }
        let graph = if submission.dependencies.is_empty() {
            None
        } else {
            let mut graph = TaskGraph::new();
            for position in 0..task_count {
                graph.add_node(position);
            }
            for (predecessor, successor) in submission.dependencies.iter().copied() {
                if predecessor >= task_count {
                    return Err(JobError::UnknownTask(predecessor));
                }
                if successor >= task_count {
                    return Err(JobError::UnknownTask(successor));
                }
                graph.add_dependency(predecessor, successor);
            }
            graph.validate()?;
            Some(graph)
        };
        let pending = submission
            .tasks
            .into_iter()
            .map(|task| (task.position(), task))
            .collect();

        let job = Job::build(
            Uuid::new_v4(),
            submission.name,
            submission.sla,
            submission.client_sla,
            submission.data_provider.map(Arc::new),
            TaskBook {
                pending,
                dispatched: BTreeSet::new(),
                graph,
                states: TaskStateMap::new(),
                results: BTreeMap::new(),
            },
            None,
            None,
        );
        job.listeners.lock().unwrap().extend(submission.listeners);
        tracing::debug!(
            "[Job {}] created job '{}' with {} tasks",
            job.uuid,
            job.name,
            task_count
        );
        Ok(Arc::new(job))
    }

    /// Creates the child of the broadcast job `parent` targeting the driver `driver`,
    /// and registers it with its parent.
    pub(crate) fn broadcast_child(parent: &Arc<Job>, driver: Uuid) -> Arc<Job> {
        let (pending, graph) = {
            let book = parent.tasks.lock().unwrap();
            (book.pending.clone(), book.graph.clone())
        };
        let child = Arc::new(Job::build(
            Uuid::new_v4(),
            format!("{} [{}]", parent.name, driver),
            parent
                .sla
                .clone()
                .with_broadcast(false)
                .with_max_channels(1),
            parent.client_sla.clone().with_max_channels(1),
            parent.data_provider.clone(),
            TaskBook {
                pending,
                dispatched: BTreeSet::new(),
                graph,
                states: TaskStateMap::new(),
                results: BTreeMap::new(),
            },
            Some(Arc::downgrade(parent)),
            Some(driver),
        ));
        if let Some(registry) = parent.channels.get() {
            let _ = child.channels.set(Weak::clone(registry));
        }
        parent
            .dispatch
            .lock()
            .unwrap()
            .children
            .insert(child.uuid, Arc::clone(&child));
        tracing::debug!(
            "[Job {}] created broadcast child {} for driver {}",
            parent.uuid,
            child.uuid,
            driver
        );
        child
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        uuid: Uuid,
        name: String,
        sla: JobSla,
        client_sla: ClientSla,
        data_provider: Option<Arc<DataProvider>>,
        book: TaskBook,
        parent: Option<Weak<Job>>,
        broadcast_target: Option<Uuid>,
    ) -> Job {
        Job {
            uuid,
            name,
            sla,
            client_sla,
            data_provider,
            task_count: book.pending.len(),
            tasks: Mutex::new(book),
            dispatch: Mutex::new(DispatchBook::default()),
            state: Mutex::new(JobState {
                status: JobStatus::New,
                submission: SubmissionStatus::Submitted,
                failed: false,
            }),
            completion: Condvar::new(),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            hooks: Mutex::new(JobHooks::default()),
            parent,
            broadcast_target,
            channels: OnceCell::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sla(&self) -> &JobSla {
        &self.sla
    }

    pub fn client_sla(&self) -> &ClientSla {
        &self.client_sla
    }

    pub fn data_provider(&self) -> Option<Arc<DataProvider>> {
        self.data_provider.clone()
    }

    /// Number of tasks submitted with the job.
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().unwrap().status
    }

    pub fn submission_status(&self) -> SubmissionStatus {
        self.state.lock().unwrap().submission
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// A broadcast job which fans out to one child per driver.
    pub fn is_broadcast_parent(&self) -> bool {
        self.sla.broadcast && self.broadcast_target.is_none()
    }

    /// The driver a broadcast child is bound to.
    pub fn broadcast_target(&self) -> Option<Uuid> {
        self.broadcast_target
    }

    pub fn parent(&self) -> Option<Arc<Job>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<Job>> {
        self.dispatch
            .lock()
            .unwrap()
            .children
            .values()
            .cloned()
            .collect()
    }

    /// Number of tasks neither dispatched nor resulted.
    pub fn pending_count(&self) -> usize {
        self.tasks.lock().unwrap().pending.len()
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.tasks.lock().unwrap().pending.is_empty()
    }

    /// Whether the job still waits for something: either undispatched tasks or tasks
    /// without a terminal state.
    pub fn has_pending(&self) -> bool {
        let book = self.tasks.lock().unwrap();
        !book.pending.is_empty() || book.states.len() < self.task_count
    }

    /// Number of tasks in `state`.
    pub fn state_count(&self, state: TaskState) -> usize {
        self.tasks.lock().unwrap().states.count(state)
    }

    /// The results received so far, ordered by position.
    pub fn results(&self) -> Vec<TaskResult> {
        self.tasks
            .lock()
            .unwrap()
            .results
            .values()
            .cloned()
            .collect()
    }

    /// The units currently executing on some channel.
    pub fn in_flight_units(&self) -> Vec<Arc<DispatchUnit>> {
        self.dispatch
            .lock()
            .unwrap()
            .in_flight
            .values()
            .filter_map(|entry| entry.unit.upgrade())
            .collect()
    }

    /// Whether a unit of the job may be sent to `channel` without exceeding the
    /// maximum number of channels allowed to execute the job at once.
    pub fn accepts_channel(&self, channel: ChannelId) -> bool {
        let limit = self.sla.max_channels.min(self.client_sla.max_channels);
        let dispatch = self.dispatch.lock().unwrap();
        let channels: HashSet<ChannelId> = dispatch
            .in_flight
            .values()
            .map(|entry| entry.channel)
            .collect();
        channels.contains(&channel) || channels.len() < limit
    }

    pub fn add_listener(&self, listener: Arc<dyn JobListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Attaches the registry used to reach the channels of in-flight units on cancel.
    pub(crate) fn attach_registry(&self, registry: Weak<ChannelRegistry>) {
        let _ = self.channels.set(registry);
    }

    /// Sets the callback invoked when a resubmitted unit makes an exhausted job
    /// dispatchable again.
    pub(crate) fn set_requeue_callback(&self, callback: RequeueCallback) {
        self.hooks.lock().unwrap().on_requeue = Some(callback);
    }

    /// Adds a hook run once when the job is done.
    pub(crate) fn add_done_hook(&self, hook: DoneHook) {
        self.hooks.lock().unwrap().on_done.push(hook);
    }

    pub(crate) fn set_submission_status(&self, status: SubmissionStatus) {
        let mut state = self.state.lock().unwrap();
        if !state.submission.is_final() {
            state.submission = status;
        }
    }

    /// Carves out a unit of at most `size` tasks.
    ///
    /// With a task graph traversed by the client, only tasks whose predecessors are
    /// done are handed out. With a graph traversed by the executing side, every
    /// remaining task goes into the unit together with its dependencies. Otherwise the
    /// first `size` tasks in position order are taken.
    pub fn copy(self: &Arc<Self>, size: usize) -> Option<Arc<DispatchUnit>> {
        if self.is_done() || self.is_cancelled() {
            return None;
        }
        let size = size.max(1);
        let (tasks, graph) = {
            let mut guard = self.tasks.lock().unwrap();
            let book = &mut *guard;
            let traversal_in_client = self.client_sla.graph_traversal_in_client;
            let selected: BTreeSet<usize> = match &book.graph {
                Some(graph) if traversal_in_client => graph
                    .available_nodes()
                    .into_iter()
                    .filter(|position| book.pending.contains_key(position))
                    .take(size)
                    .collect(),
                Some(_) => book.pending.keys().copied().collect(),
                None => book.pending.keys().copied().take(size).collect(),
            };
            if selected.is_empty() {
                return None;
            }
            let tasks: Vec<Task> = selected
                .iter()
                .filter_map(|position| book.pending.remove(position))
                .collect();
            let unit_graph = match &book.graph {
                Some(graph) => {
                    book.dispatched.extend(selected.iter().copied());
                    if traversal_in_client {
                        None
                    } else {
                        Some(graph.subgraph(&selected))
                    }
                }
                None => None,
            };
            (tasks, unit_graph)
        };
        let unit = Arc::new(DispatchUnit::new(Arc::clone(self), tasks, graph));
        tracing::trace!(
            "[Job {}] carved unit {} with positions {:?}",
            self.uuid,
            unit.id(),
            unit.positions()
        );
        Some(unit)
    }

    /// Registers `unit` as executing on `channel`.
    pub(crate) fn job_dispatched(&self, unit: &Arc<DispatchUnit>, channel: ChannelId) {
        self.dispatch.lock().unwrap().in_flight.insert(
            unit.id(),
            InFlight {
                unit: Arc::downgrade(unit),
                channel,
            },
        );
        if self.is_cancelled() {
            // The cancel did not see this unit.
            unit.cancel();
        }
        self.mark_executing(JobEvent {
            job_uuid: self.uuid,
            job_name: self.name.clone(),
            channel: Some(channel),
            positions: unit.positions(),
            results: Vec::new(),
        });
    }

    /// Forgets `unit` without resolving its tasks, for units dropped by a closing
    /// channel.
    pub(crate) fn unit_abandoned(&self, unit: &DispatchUnit) {
        self.dispatch.lock().unwrap().in_flight.remove(&unit.id());
        tracing::debug!("[Job {}] unit {} abandoned", self.uuid, unit.id());
    }

    fn mark_executing(&self, event: JobEvent) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status == JobStatus::New {
                state.status = JobStatus::Executing;
            }
            if !state.submission.is_final() {
                state.submission = SubmissionStatus::Executing;
            }
        }
        for listener in self.listeners() {
            listener.job_dispatched(&event);
        }
        if let Some(parent) = self.parent() {
            parent.mark_executing(JobEvent {
                job_uuid: parent.uuid,
                job_name: parent.name.clone(),
                ..event
            });
        }
    }

    /// Positions among `positions` without a terminal state.
    pub fn unresolved_positions(&self, positions: &[usize]) -> Vec<usize> {
        let book = self.tasks.lock().unwrap();
        positions
            .iter()
            .copied()
            .filter(|position| !book.states.contains(*position))
            .collect()
    }

    /// Folds `results` into the job. Positions which already have a terminal state
    /// keep it.
    pub fn results_received(&self, results: Vec<TaskResult>) {
        let fresh: Vec<TaskResult> = {
            let mut guard = self.tasks.lock().unwrap();
            let book = &mut *guard;
            let mut fresh = Vec::with_capacity(results.len());
            for result in results {
                let position = result.position;
                if position >= self.task_count || book.states.contains(position) {
                    continue;
                }
                book.states.put(position, result.state());
                book.pending.remove(&position);
                book.dispatched.remove(&position);
                if let Some(graph) = book.graph.as_mut() {
                    graph.node_done(position);
                }
                book.results.insert(position, result.clone());
                fresh.push(result);
            }
            fresh
        };
        if fresh.is_empty() {
            return;
        }
        tracing::trace!("[Job {}] received {} results", self.uuid, fresh.len());
        let event = JobEvent {
            job_uuid: self.uuid,
            job_name: self.name.clone(),
            channel: None,
            positions: fresh.iter().map(|result| result.position).collect(),
            results: fresh.clone(),
        };
        for listener in self.listeners() {
            listener.job_returned(&event);
        }
        if let Some(parent) = self.parent() {
            // Empty completions of one child must not mask the results of another;
            // the parent fills its own gaps once every child is done.
            let produced: Vec<TaskResult> = fresh
                .into_iter()
                .filter(|result| result.outcome != TaskOutcome::Empty)
                .collect();
            if !produced.is_empty() {
                parent.results_received(produced);
            }
        }
    }

    /// Convergence point of a unit, reached once per unit whatever its outcome.
    /// Called through [`DispatchUnit::task_completed`].
    pub(crate) fn task_completed(&self, unit: &DispatchUnit, error: Option<&DispatchError>) {
        let still_in_flight = {
            let mut dispatch = self.dispatch.lock().unwrap();
            dispatch.in_flight.remove(&unit.id());
            !dispatch.in_flight.is_empty()
        };
        let cancelled = self.is_cancelled();
        let mut synthetic = Vec::new();
        let mut requeue = false;
        {
            let mut guard = self.tasks.lock().unwrap();
            let book = &mut *guard;
            if self.broadcast_target.is_some() || unit.is_cancelled() || cancelled {
                for task in unit.tasks() {
                    if !book.states.contains(task.position()) {
                        synthetic.push(TaskResult::empty(task.position()));
                    }
                }
            } else if unit.is_requeued() {
                let was_empty = book.pending.is_empty();
                let mut merged = 0;
                for task in unit.tasks() {
                    let position = task.position();
                    if !book.states.contains(position) && !book.pending.contains_key(&position) {
                        book.dispatched.remove(&position);
                        book.pending.insert(position, task.clone());
                        merged += 1;
                    }
                }
                requeue = was_empty && merged > 0;
                tracing::debug!(
                    "[Job {}] unit {} resubmitted, {} tasks back in the pending set",
                    self.uuid,
                    unit.id(),
                    merged
                );
            } else {
                let message = match error {
                    Some(e) => e.to_string(),
                    None => "no result returned".to_string(),
                };
                for task in unit.tasks() {
                    if !book.states.contains(task.position()) {
                        synthetic.push(TaskResult::exception(
                            task.position(),
                            TaskError::Dispatch(message.clone()),
                        ));
                    }
                }
            }
            if cancelled {
                let pending = std::mem::take(&mut book.pending);
                synthetic.extend(pending.into_keys().map(TaskResult::empty));
            }
        }
        self.results_received(synthetic);

        if let Some(error) = error {
            let mut state = self.state.lock().unwrap();
            if error.is_serialization() {
                tracing::debug!(
                    "[Job {}] unit {} ended with {}",
                    self.uuid,
                    unit.id(),
                    error
                );
            } else {
                tracing::warn!("[Job {}] unit {} failed: {}", self.uuid, unit.id(), error);
                state.failed = true;
                if !state.submission.is_final() {
                    state.submission = SubmissionStatus::Failed;
                }
            }
        }

        if requeue && !cancelled {
            {
                let mut state = self.state.lock().unwrap();
                if !still_in_flight && state.status == JobStatus::Executing {
                    state.status = JobStatus::New;
                    if !state.submission.is_final() {
                        state.submission = SubmissionStatus::Pending;
                    }
                }
            }
            let callback = self.hooks.lock().unwrap().on_requeue.clone();
            if let Some(callback) = callback {
                callback(unit.job());
            }
        }

        if !self.has_pending() {
            self.finish();
        }
    }

    /// Cancels the job: flags it, cascades to broadcast children, cancels every
    /// in-flight unit on its channel, and asks each remote driver involved to cancel
    /// the job, once per driver. Returns `false` if the job was already cancelled or
    /// done.
    pub fn cancel(&self) -> bool {
        if self.is_done() || self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!("[Job {}] cancelling job '{}'", self.uuid, self.name);
        let (units, children) = {
            let dispatch = self.dispatch.lock().unwrap();
            let units: Vec<(Arc<DispatchUnit>, ChannelId)> = dispatch
                .in_flight
                .values()
                .filter_map(|entry| entry.unit.upgrade().map(|unit| (unit, entry.channel)))
                .collect();
            let children: Vec<Arc<Job>> = dispatch.children.values().cloned().collect();
            (units, children)
        };
        for child in children.iter() {
            child.cancel();
        }

        let registry = self.channels.get().and_then(Weak::upgrade);
        for (unit, channel_id) in units.iter() {
            unit.cancel();
            let channel = match registry.as_ref().and_then(|r| r.get(*channel_id)) {
                Some(channel) => channel,
                None => continue,
            };
            channel.cancel(unit);
            if channel.is_local() {
                continue;
            }
            if let Some(driver) = channel.driver_uuid() {
                let first = self
                    .dispatch
                    .lock()
                    .unwrap()
                    .cancelled_drivers
                    .insert(driver);
                if !first {
                    continue;
                }
                if let Some(management) = channel.management() {
                    tracing::debug!(
                        "[Job {}] requesting cancellation from driver {}",
                        self.uuid,
                        driver
                    );
                    if let Err(e) = management.cancel_job(self.uuid) {
                        tracing::warn!(
                            "[Job {}] driver {} failed to cancel the job: {}",
                            self.uuid,
                            driver,
                            e
                        );
                    }
                }
            }
        }

        if units.is_empty() && children.is_empty() {
            self.complete_remaining();
        }
        true
    }

    /// Called by a broadcast child once it is done.
    fn child_completed(&self, child: Uuid) {
        let remaining = {
            let mut dispatch = self.dispatch.lock().unwrap();
            dispatch.children.remove(&child);
            dispatch.children.len()
        };
        tracing::debug!(
            "[Job {}] broadcast child {} done, {} remaining",
            self.uuid,
            child,
            remaining
        );
        if remaining == 0 {
            self.complete_remaining();
        }
    }

    /// Force-completes every task without a terminal state and finishes the job.
    fn complete_remaining(&self) {
        let synthetic: Vec<TaskResult> = {
            let mut book = self.tasks.lock().unwrap();
            book.pending.clear();
            (0..self.task_count)
                .filter(|position| !book.states.contains(*position))
                .map(TaskResult::empty)
                .collect()
        };
        self.results_received(synthetic);
        if !self.has_pending() {
            self.finish();
        }
    }

    fn finish(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let submission = {
            let mut state = self.state.lock().unwrap();
            state.status = JobStatus::Done;
            state.submission = if state.failed {
                SubmissionStatus::Failed
            } else if self.is_cancelled() {
                SubmissionStatus::Cancelled
            } else {
                SubmissionStatus::Complete
            };
            state.submission
        };
        self.completion.notify_all();
        tracing::debug!(
            "[Job {}] job '{}' done: {:?}",
            self.uuid,
            self.name,
            submission
        );

        let event = JobEvent {
            job_uuid: self.uuid,
            job_name: self.name.clone(),
            channel: None,
            positions: Vec::new(),
            results: Vec::new(),
        };
        for listener in self.listeners() {
            listener.job_ended(&event);
        }
        let hooks = std::mem::take(&mut self.hooks.lock().unwrap().on_done);
        for hook in hooks {
            hook(self);
        }
        if let Some(parent) = self.parent() {
            parent.child_completed(self.uuid);
        }
    }

    /// Blocks until the job is done, or until `timeout` elapses.
    /// Returns whether the job is done.
    pub fn await_done(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock().unwrap();
        while state.status != JobStatus::Done {
            match deadline {
                None => state = self.completion.wait(state).unwrap(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    state = self.completion.wait_timeout(state, remaining).unwrap().0;
                }
            }
        }
        true
    }

    fn listeners(&self) -> Vec<Arc<dyn JobListener>> {
        self.listeners.lock().unwrap().clone()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("task_count", &self.task_count)
            .field("cancelled", &self.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;

    use super::*;
    use crate::communication::CommunicationError;

    fn make_submission(num_tasks: usize) -> JobSubmission {
        let mut submission = JobSubmission::new("test-job");
        for _ in 0..num_tasks {
            submission.add_task(Task::new(|ctx: &TaskContext| {
                Ok(Bytes::from(ctx.position().to_string()))
            }));
        }
        submission
    }

    fn make_broadcast_parent(num_tasks: usize) -> Arc<Job> {
        let sla = JobSla::new().with_broadcast(true);
        let submission = make_submission(num_tasks).with_sla(sla);
        Job::from_submission(submission).unwrap()
    }

    fn results_for(unit: &DispatchUnit) -> Vec<TaskResult> {
        unit.positions()
            .into_iter()
            .map(|position| TaskResult::result(position, Bytes::from(position.to_string())))
            .collect()
    }

    #[derive(Default)]
    struct CountingListener {
        ended: AtomicUsize,
        returned: AtomicUsize,
    }

    impl JobListener for CountingListener {
        fn job_returned(&self, event: &JobEvent) {
            self.returned
                .fetch_add(event.results.len(), Ordering::SeqCst);
        }

        fn job_ended(&self, _event: &JobEvent) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Test that submissions are validated.
    #[test]
    fn test_submission_validation() {
        assert!(matches!(
            Job::from_submission(JobSubmission::new("empty")),
            Err(JobError::EmptyJob)
        ));

        let mut submission = make_submission(2);
        submission.add_dependency(0, 5);
        assert!(matches!(
            Job::from_submission(submission),
            Err(JobError::UnknownTask(5))
        ));

        let mut submission = make_submission(2);
        submission.add_dependency(0, 1);
        submission.add_dependency(1, 0);
        assert!(matches!(
            Job::from_submission(submission),
            Err(JobError::CyclicDependency)
        ));
    }

    /// Test that units are carved in position order and that the job completes once
    /// every task has a result.
    #[test]
    fn test_copy_in_position_order() {
        let listener = Arc::new(CountingListener::default());
        let submission = make_submission(5).with_listener(listener.clone());
        let job = Job::from_submission(submission).unwrap();

        let first = job.copy(2).unwrap();
        let second = job.copy(2).unwrap();
        let third = job.copy(2).unwrap();
        assert!(job.copy(2).is_none(), "Every task has been handed out.");
        assert_eq!(first.positions(), vec![0, 1]);
        assert_eq!(second.positions(), vec![2, 3]);
        assert_eq!(third.positions(), vec![4]);

        for unit in [&first, &second, &third] {
            unit.job_dispatched(0);
            assert_eq!(job.status(), JobStatus::Executing);
            unit.results_received(results_for(unit));
            unit.task_completed(None);
        }
        assert!(job.is_done());
        assert_eq!(job.submission_status(), SubmissionStatus::Complete);
        assert_eq!(job.results().len(), 5);
        assert_eq!(
            listener.ended.load(Ordering::SeqCst),
            1,
            "The job ends exactly once."
        );
        assert_eq!(listener.returned.load(Ordering::SeqCst), 5);
        assert!(job.in_flight_units().is_empty());
    }

    /// Test that completing a unit twice does not count its tasks twice.
    #[test]
    fn test_task_completed_is_idempotent() {
        let job = Job::from_submission(make_submission(4)).unwrap();
        let first = job.copy(2).unwrap();
        let second = job.copy(2).unwrap();
        first.job_dispatched(0);
        second.job_dispatched(1);

        first.results_received(results_for(&first));
        first.results_received(results_for(&first));
        assert!(first.task_completed(None));
        assert!(!first.task_completed(None));
        assert_eq!(job.state_count(TaskState::Result), 2);
        assert!(job.has_pending(), "The second unit is still executing.");
        assert!(!job.is_done());

        second.results_received(results_for(&second));
        second.task_completed(None);
        assert!(job.is_done());
    }

    /// Test that a resubmitted unit puts its tasks back and re-enters the queue when
    /// the job had nothing left to dispatch.
    #[test]
    fn test_requeue_merges_tasks_back() {
        let job = Job::from_submission(make_submission(3)).unwrap();
        let requeues = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requeues);
        job.set_requeue_callback(Arc::new(move |_job: &Arc<Job>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let unit = job.copy(3).unwrap();
        unit.job_dispatched(0);
        unit.results_received(vec![TaskResult::result(1, Bytes::from_static(b"1"))]);
        assert!(unit.resubmit());
        assert!(unit.task_completed(None));

        assert_eq!(requeues.load(Ordering::SeqCst), 1);
        assert_eq!(
            job.pending_count(),
            2,
            "Only the unresolved tasks come back."
        );
        assert_eq!(job.status(), JobStatus::New);
        assert!(!job.is_done());

        let retry = job.copy(3).unwrap();
        assert_eq!(retry.positions(), vec![0, 2]);
        retry.job_dispatched(1);
        retry.results_received(results_for(&retry));
        retry.task_completed(None);
        assert!(job.is_done());
        assert_eq!(job.results().len(), 3);
    }

    /// Test that a graph traversed by the client releases tasks as their predecessors
    /// complete, and that a graph traversed by the server is sent in one unit.
    #[test]
    fn test_graph_partitioning() {
        let mut submission = make_submission(3)
            .with_client_sla(ClientSla::new().with_graph_traversal_in_client(true));
        submission.add_dependency(0, 1);
        submission.add_dependency(1, 2);
        let job = Job::from_submission(submission).unwrap();

        let head = job.copy(3).unwrap();
        assert_eq!(head.positions(), vec![0]);
        assert!(job.copy(3).is_none(), "Task 1 waits for task 0.");
        head.job_dispatched(0);
        head.results_received(results_for(&head));
        head.task_completed(None);

        let middle = job.copy(3).unwrap();
        assert_eq!(middle.positions(), vec![1]);

        let mut submission = make_submission(3);
        submission.add_dependency(0, 1);
        let job = Job::from_submission(submission).unwrap();
        let unit = job.copy(1).unwrap();
        assert_eq!(
            unit.positions(),
            vec![0, 1, 2],
            "The server orders the tasks."
        );
        assert_eq!(unit.graph().map(|g| g.remaining()), Some(3));
    }

    /// Test that cancelling a job with nothing in flight completes it right away.
    #[test]
    fn test_cancel_without_units_completes() {
        let job = Job::from_submission(make_submission(3)).unwrap();
        assert!(job.cancel());
        assert!(!job.cancel(), "A job is cancelled once.");
        assert!(job.is_done());
        assert_eq!(job.submission_status(), SubmissionStatus::Cancelled);
        assert!(job
            .results()
            .iter()
            .all(|result| result.outcome == TaskOutcome::Empty));
    }

    /// Test that a cancelled unit keeps the results it already had.
    #[test]
    fn test_cancelled_unit_keeps_results() {
        let job = Job::from_submission(make_submission(2)).unwrap();
        let unit = job.copy(2).unwrap();
        unit.job_dispatched(0);
        unit.results_received(vec![TaskResult::result(0, Bytes::from_static(b"0"))]);
        assert!(job.cancel());
        assert!(
            unit.is_cancelled(),
            "The in-flight unit observes the cancel."
        );
        unit.task_completed(None);

        let results = job.results();
        assert_eq!(results[0].data(), Some(&Bytes::from_static(b"0")));
        assert_eq!(results[1].outcome, TaskOutcome::Empty);
        assert_eq!(job.submission_status(), SubmissionStatus::Cancelled);
    }

    /// Test how unit errors affect the submission status.
    #[test]
    fn test_error_status() {
        let job = Job::from_submission(make_submission(1)).unwrap();
        let unit = job.copy(1).unwrap();
        let error = DispatchError::from(CommunicationError::NotSerializable("x".to_string()));
        unit.results_received_error(&error);
        unit.task_completed(Some(&error));
        assert_eq!(job.submission_status(), SubmissionStatus::Complete);
        assert!(matches!(
            job.results()[0].error(),
            Some(TaskError::NotSerializable(_))
        ));

        let job = Job::from_submission(make_submission(1)).unwrap();
        let unit = job.copy(1).unwrap();
        let error = DispatchError::Execution("boom".to_string());
        unit.results_received_error(&error);
        unit.task_completed(Some(&error));
        assert_eq!(job.submission_status(), SubmissionStatus::Failed);
        assert!(job.is_done());
    }

    /// Test that a broadcast parent ends only after all its children, whatever their
    /// completion order.
    #[test]
    fn test_broadcast_parent_waits_for_children() {
        let parent = make_broadcast_parent(2);
        let first = Job::broadcast_child(&parent, Uuid::new_v4());
        let second = Job::broadcast_child(&parent, Uuid::new_v4());
        assert_eq!(parent.children().len(), 2);

        let first_unit = first.copy(2).unwrap();
        let second_unit = second.copy(2).unwrap();
        first_unit.job_dispatched(0);
        second_unit.job_dispatched(1);
        assert_eq!(parent.status(), JobStatus::Executing);

        // The second child completes first.
        second_unit.results_received(results_for(&second_unit));
        second_unit.task_completed(None);
        assert!(second.is_done());
        assert!(!parent.is_done(), "The first child is still executing.");

        first_unit.task_completed(None);
        assert!(first.is_done());
        assert!(parent.is_done());
        assert_eq!(parent.results().len(), 2);
        assert!(parent
            .results()
            .iter()
            .all(|result| result.data().is_some()));
    }

    /// Test that the empty completions of a resubmitted child do not hide the results
    /// of a child that ran the tasks.
    #[test]
    fn test_broadcast_keeps_results_of_surviving_child() {
        let parent = make_broadcast_parent(2);
        let lost = Job::broadcast_child(&parent, Uuid::new_v4());
        let surviving = Job::broadcast_child(&parent, Uuid::new_v4());
        let lost_unit = lost.copy(2).unwrap();
        let surviving_unit = surviving.copy(2).unwrap();
        lost_unit.job_dispatched(0);
        surviving_unit.job_dispatched(1);

        // The driver of the first child goes away before returning anything.
        assert!(lost_unit.resubmit());
        lost_unit.task_completed(None);
        assert!(lost.is_done());
        assert!(!parent.is_done());
        assert!(parent.results().is_empty());

        surviving_unit.results_received(results_for(&surviving_unit));
        surviving_unit.task_completed(None);
        assert!(parent.is_done());
        assert_eq!(parent.submission_status(), SubmissionStatus::Complete);
        let outcomes: Vec<Option<Bytes>> = parent
            .results()
            .iter()
            .map(|result| result.data().cloned())
            .collect();
        assert_eq!(
            outcomes,
            vec![Some(Bytes::from("0")), Some(Bytes::from("1"))]
        );
    }

    /// Test that a cancelled broadcast job still gives every task a terminal state.
    #[test]
    fn test_cancelled_broadcast_completes_empty() {
        let parent = make_broadcast_parent(2);
        let child = Job::broadcast_child(&parent, Uuid::new_v4());
        let unit = child.copy(2).unwrap();
        unit.job_dispatched(0);

        assert!(parent.cancel());
        assert!(unit.is_cancelled());
        unit.task_completed(None);
        assert!(child.is_done());
        assert!(parent.is_done());
        assert_eq!(parent.results().len(), 2);
        assert!(parent
            .results()
            .iter()
            .all(|result| result.outcome == TaskOutcome::Empty));
        assert_eq!(parent.submission_status(), SubmissionStatus::Cancelled);
    }
}
