use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::future;
use tokio::runtime::Handle;

use crate::{
    job::{DispatchError, DispatchUnit, Task, TaskError, TaskResult},
    UnitId,
};

use super::{complete_unit, Channel, ChannelCore, ChannelSettings, ConnectionStatus};

/// Executes the tasks of a unit in-process.
#[async_trait]
pub trait ExecutionManager: Send + Sync {
    /// Runs the tasks of `unit` and returns their results. Tasks skipped because the
    /// unit was cancelled have no result.
    async fn execute(&self, unit: Arc<DispatchUnit>) -> Result<Vec<TaskResult>, DispatchError>;
}

/// Runs each task on the blocking thread pool of the runtime.
///
/// Independent tasks run concurrently. Tasks carrying dependencies run one after the
/// other in dependency order.
#[derive(Debug, Default, Clone)]
pub struct ThreadPoolExecutionManager {
    default_timeout: Option<Duration>,
}

impl ThreadPoolExecutionManager {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }

    async fn run_task(&self, unit: &DispatchUnit, task: Task) -> Option<TaskResult> {
        if unit.is_cancelled() {
            return None;
        }
        let position = task.position();
        let timeout = task.timeout().or(self.default_timeout);
        let context = unit.task_context(&task);
        let handle = tokio::task::spawn_blocking(move || task.execute(&context));
        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::debug!(
                        "[Job {}] task {} timed out after {:?}",
                        unit.job_uuid(),
                        position,
                        limit
                    );
                    return Some(TaskResult::exception(position, TaskError::Timeout(limit)));
                }
            },
            None => handle.await,
        };
        Some(match joined {
            Ok(result) => result,
            Err(e) => TaskResult::exception(position, TaskError::Panicked(e.to_string())),
        })
    }
}

#[async_trait]
impl ExecutionManager for ThreadPoolExecutionManager {
    async fn execute(&self, unit: Arc<DispatchUnit>) -> Result<Vec<TaskResult>, DispatchError> {
        match unit.graph() {
            Some(graph) => {
                let order = graph
                    .topological_order()
                    .map_err(|e| DispatchError::Execution(e.to_string()))?;
                let tasks: HashMap<usize, &Task> = unit
                    .tasks()
                    .iter()
                    .map(|task| (task.position(), task))
                    .collect();
                let mut results = Vec::with_capacity(order.len());
                for position in order {
                    let task = match tasks.get(&position) {
                        Some(task) => (*task).clone(),
                        None => continue,
                    };
                    if let Some(result) = self.run_task(&unit, task).await {
                        results.push(result);
                    }
                }
                Ok(results)
            }
            None => {
                let runs = unit
                    .tasks()
                    .iter()
                    .cloned()
                    .map(|task| self.run_task(&unit, task));
                let results = future::join_all(runs).await;
                Ok(results.into_iter().flatten().collect())
            }
        }
    }
}

/// Executes units in the client process.
pub struct LocalChannel {
    core: ChannelCore,
    executor: Arc<dyn ExecutionManager>,
    runtime: Handle,
    running: Mutex<HashMap<UnitId, Arc<DispatchUnit>>>,
}

impl LocalChannel {
    pub fn new(
        core: ChannelCore,
        executor: Arc<dyn ExecutionManager>,
        runtime: Handle,
    ) -> Self {
        Self {
            core,
            executor,
            runtime,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// A local channel running tasks on the blocking thread pool of `runtime`.
    pub fn with_thread_pool(
        id: crate::ChannelId,
        settings: ChannelSettings,
        default_timeout: Option<Duration>,
        runtime: Handle,
    ) -> Self {
        Self::new(
            ChannelCore::new(id, settings),
            Arc::new(ThreadPoolExecutionManager::new(default_timeout)),
            runtime,
        )
    }

    async fn execute(&self, unit: Arc<DispatchUnit>) {
        let mut error = None;
        if unit.is_cancelled() {
            tracing::debug!(
                "[LocalChannel {}] unit {} cancelled before start",
                self.core.id(),
                unit.id()
            );
        } else {
            tracing::debug!(
                "[LocalChannel {}] executing unit {} of job {} ({} tasks)",
                self.core.id(),
                unit.id(),
                unit.job_uuid(),
                unit.task_count()
            );
            let started = Instant::now();
            match self.executor.execute(Arc::clone(&unit)).await {
                Ok(results) => unit.results_received(results),
                Err(e) => {
                    tracing::warn!(
                        "[LocalChannel {}] unit {} failed: {}",
                        self.core.id(),
                        unit.id(),
                        e
                    );
                    unit.results_received_error(&e);
                    error = Some(e);
                }
            }
            self.core
                .record_round_trip(unit.task_count(), started.elapsed());
        }
        self.running.lock().unwrap().remove(&unit.id());
        complete_unit(&self.core, &unit, error.as_ref());
    }
}

impl Channel for LocalChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn start(self: Arc<Self>) {
        self.core.init_channel_id(None);
        self.core.set_status(ConnectionStatus::Active);
    }

    fn submit(self: Arc<Self>, unit: Arc<DispatchUnit>) {
        self.running
            .lock()
            .unwrap()
            .insert(unit.id(), Arc::clone(&unit));
        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            self.execute(unit).await;
        });
    }

    /// Tasks already running are left to finish; the ones not started are skipped.
    fn cancel(&self, unit: &DispatchUnit) -> bool {
        let found = self.running.lock().unwrap().contains_key(&unit.id());
        if found {
            unit.cancel();
        }
        found
    }

    fn is_local(&self) -> bool {
        true
    }

    fn is_asynchronous(&self) -> bool {
        false
    }

    fn close(&self) {
        self.core.set_closing();
        self.core.set_status(ConnectionStatus::Closed);
        for unit in self.running.lock().unwrap().values() {
            unit.cancel();
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::job::{ClientSla, Job, JobSubmission, TaskContext};

    fn echo_task() -> Task {
        Task::new(|ctx: &TaskContext| Ok(Bytes::from(ctx.position().to_string())))
    }

    /// Test that independent tasks all return a result.
    #[tokio::test]
    async fn test_execute_independent_tasks() {
        let mut submission = JobSubmission::new("local-test");
        for _ in 0..3 {
            submission.add_task(echo_task());
        }
        let job = Job::from_submission(submission).unwrap();
        let unit = job.copy(3).unwrap();
        let manager = ThreadPoolExecutionManager::new(None);
        let mut results = manager.execute(unit).await.unwrap();
        results.sort_by_key(|result| result.position);
        let positions: Vec<usize> = results.iter().map(|result| result.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(results[2].data(), Some(&Bytes::from("2")));
    }

    /// Test that a task running past its timeout resolves as a timeout exception.
    #[tokio::test]
    async fn test_task_timeout() {
        let mut submission = JobSubmission::new("timeout-test");
        submission.add_task(
            Task::new(|_ctx: &TaskContext| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(Bytes::new())
            })
            .with_timeout(Duration::from_millis(20)),
        );
        let job = Job::from_submission(submission).unwrap();
        let unit = job.copy(1).unwrap();
        let results = ThreadPoolExecutionManager::new(None)
            .execute(unit)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].error(),
            Some(&TaskError::Timeout(Duration::from_millis(20)))
        );
    }

    /// Test that dependent tasks run in dependency order.
    #[tokio::test]
    async fn test_dependencies_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut submission = JobSubmission::new("graph-test")
            .with_client_sla(ClientSla::default().with_graph_traversal_in_client(false));
        for _ in 0..3 {
            let order = Arc::clone(&order);
            submission.add_task(Task::new(move |ctx: &TaskContext| {
                order.lock().unwrap().push(ctx.position());
                Ok(Bytes::new())
            }));
        }
        submission.add_dependency(2, 0);
        submission.add_dependency(0, 1);
        let job = Job::from_submission(submission).unwrap();
        let unit = job.copy(1).unwrap();
        assert!(
            unit.graph().is_some(),
            "The unit should carry its dependencies."
        );
        let results = ThreadPoolExecutionManager::new(None)
            .execute(unit)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(*order.lock().unwrap(), vec![2, 0, 1]);
    }

    /// Test that a cancelled unit runs nothing.
    #[tokio::test]
    async fn test_cancelled_unit_is_skipped() {
        let mut submission = JobSubmission::new("cancel-test");
        submission.add_task(echo_task());
        let job = Job::from_submission(submission).unwrap();
        let unit = job.copy(1).unwrap();
        unit.cancel();
        let results = ThreadPoolExecutionManager::new(None)
            .execute(unit)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
