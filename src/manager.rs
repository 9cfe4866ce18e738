use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use uuid::Uuid;

use crate::{
    channel::{
        Channel, ChannelCore, ChannelRegistry, ChannelSettings, ConnectionStatus, LocalChannel,
        RemoteAsyncChannel, RemoteSyncChannel,
    },
    communication::{CodebaseRegistry, ManagementClient, TaskServerConnection},
    job::{Job, JobError, JobStatus, JobSubmission, SubmissionStatus, TaskResult},
    load_balancer::{FixedSizeBundlerFactory, LoadBalancerPersistence, NoopPersistence},
    scheduler::{JobQueue, JobScheduler, QueueListener, SchedulerWaker},
    ChannelId, Configuration,
};

/// How a remote connection is turned into a channel.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Whether the channel pipelines units instead of doing one round trip at a time.
    pub asynchronous: bool,
    pub priority: i32,
    /// The number of units an asynchronous channel keeps in flight. Synchronous
    /// channels always execute one unit at a time.
    pub max_jobs: usize,
    /// The administrative link used to cancel jobs on the driver.
    pub management: Option<Arc<dyn ManagementClient>>,
}

impl ConnectionOptions {
    /// Options of a synchronous channel with priority 0.
    pub fn new() -> Self {
        Self {
            asynchronous: false,
            priority: 0,
            max_jobs: 1,
            management: None,
        }
    }

    /// Makes the channel asynchronous, with up to `max_jobs` units in flight.
    pub fn asynchronous(mut self, max_jobs: usize) -> Self {
        self.asynchronous = true;
        self.max_jobs = max_jobs.max(1);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_management(mut self, management: Arc<dyn ManagementClient>) -> Self {
        self.management = Some(management);
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// The entry point of the dispatch engine.
///
/// The manager owns the runtime the channels and the dispatch loop run on, the channel
/// registry, and the queue of live jobs. Submitting a job returns a [`JobHandle`]
/// through which its results are awaited.
pub struct DispatchManager {
    config: Configuration,
    registry: Arc<ChannelRegistry>,
    queue: Arc<JobQueue>,
    waker: Arc<SchedulerWaker>,
    factory: Arc<FixedSizeBundlerFactory>,
    persistence: Arc<dyn LoadBalancerPersistence>,
    codebases: Arc<CodebaseRegistry>,
    local_channel: Mutex<Option<Arc<LocalChannel>>>,
    shutdown: Arc<AtomicBool>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    handle: Handle,
    /// The Tokio runtime the channels and the dispatch loop run on.
    runtime: Mutex<Option<Runtime>>,
    /// A handle for the Logging subsystem that flushes the logs when dropped.
    _logger_guard: Option<WorkerGuard>,
}

impl DispatchManager {
    pub fn new(config: Configuration) -> Result<Self, JobError> {
        Self::with_persistence(config, Arc::new(NoopPersistence))
    }

    /// Creates a manager whose channels store their load-balancer state in
    /// `persistence`.
    pub fn with_persistence(
        config: Configuration,
        persistence: Arc<dyn LoadBalancerPersistence>,
    ) -> Result<Self, JobError> {
        // Initialize the logger.
        let logger_guard = if let Some(logging_level) = config.logging_level {
            let display_thread_ids = logging_level >= Level::TRACE;
            let display_target = logging_level >= Level::TRACE;

            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());
            let subscriber = tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_thread_ids(display_thread_ids)
                .with_span_events(FmtSpan::FULL)
                .with_target(display_target)
                .with_max_level(logging_level);
            // Only the first manager of the process installs the global subscriber.
            if subscriber.try_init().is_err() {
                tracing::trace!("A global logger is already installed");
            }
            Some(guard)
        } else {
            None
        };

        // Build a Tokio runtime.
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.num_threads)
            .thread_name("grid-dispatch")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let registry = Arc::new(ChannelRegistry::new());
        let waker = Arc::new(SchedulerWaker::new());
        let queue = JobQueue::new(Arc::clone(&registry), Arc::clone(&waker));
        let shutdown = Arc::new(AtomicBool::new(false));
        let scheduler = JobScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&waker),
            config.scheduler_interval,
            Arc::clone(&shutdown),
        );
        let scheduler_task = handle.spawn(async move { scheduler.run().await });

        let manager = Self {
            factory: Arc::new(FixedSizeBundlerFactory::new(config.bundle_size)),
            config,
            registry,
            queue,
            waker,
            persistence,
            codebases: Arc::new(CodebaseRegistry::new()),
            local_channel: Mutex::new(None),
            shutdown,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            handle,
            runtime: Mutex::new(Some(runtime)),
            _logger_guard: logger_guard,
        };
        if manager.config.local_execution_enabled {
            manager.set_local_execution_enabled(true);
        }
        tracing::debug!("Initialized a DispatchManager");
        Ok(manager)
    }

    fn channel_settings(&self, name: &str, priority: i32, max_jobs: usize) -> ChannelSettings {
        ChannelSettings::new(name, Arc::clone(&self.factory) as _)
            .with_priority(priority)
            .with_max_jobs(max_jobs)
            .with_persistence(Arc::clone(&self.persistence))
            .with_waker(Arc::clone(&self.waker))
            .with_reconnect_policy(
                self.config.reconnect_attempts,
                self.config.reconnect_interval,
            )
    }

    /// Keeps the working index, the broadcast jobs and the dispatch loop in line with
    /// the status of `channel`.
    fn watch_channel(&self, channel: &Arc<dyn Channel>) {
        let priority = channel.core().priority();
        let driver = channel.driver_uuid();
        let weak_channel: Weak<dyn Channel> = Arc::downgrade(channel);
        let registry = Arc::downgrade(&self.registry);
        let queue = Arc::downgrade(&self.queue);
        let waker = Arc::clone(&self.waker);
        channel
            .core()
            .add_connection_status_listener(Arc::new(move |change| {
                let registry = match registry.upgrade() {
                    Some(registry) => registry,
                    None => return,
                };
                let status = change.new;
                registry.update_working(change.channel, priority, status);
                if change.new == ConnectionStatus::Active
                    && change.old != ConnectionStatus::Executing
                {
                    if let Some(channel) = weak_channel.upgrade() {
                        channel.core().init_channel_id(driver);
                    }
                    if let Some(queue) = queue.upgrade() {
                        queue.process_pending_broadcasts();
                    }
                }
                let left_working = change.old.is_working() && !change.new.is_working();
                if left_working || change.new.is_terminated() {
                    if let (Some(driver), Some(queue)) = (driver, queue.upgrade()) {
                        if !registry.working_drivers().contains(&driver) {
                            queue.cancel_broadcast_jobs(driver);
                        }
                    }
                }
                waker.wake();
            }));
    }

    /// Turns `connection` into a channel and starts connecting it.
    pub fn add_connection(
        &self,
        connection: Arc<dyn TaskServerConnection>,
        options: ConnectionOptions,
    ) -> ChannelId {
        let id = self.registry.next_id();
        let max_jobs = if options.asynchronous {
            options.max_jobs
        } else {
            1
        };
        let name = connection.name();
        let core = ChannelCore::new(
            id,
            self.channel_settings(&name, options.priority, max_jobs),
        );
        let channel: Arc<dyn Channel> = if options.asynchronous {
            Arc::new(RemoteAsyncChannel::new(
                core,
                connection,
                Arc::clone(&self.codebases),
                options.management,
                self.handle.clone(),
            ))
        } else {
            Arc::new(RemoteSyncChannel::new(
                core,
                connection,
                Arc::clone(&self.codebases),
                options.management,
                self.handle.clone(),
            ))
        };
        tracing::debug!(
            "Adding {} channel {} (priority {}, driver {:?})",
            if options.asynchronous { "asynchronous" } else { "synchronous" },
            id,
            options.priority,
            channel.driver_uuid()
        );
        self.watch_channel(&channel);
        self.registry.add(Arc::clone(&channel));
        channel.start();
        id
    }

    /// Enables or disables the local channel, creating it the first time it is enabled.
    pub fn set_local_execution_enabled(&self, enabled: bool) {
        let mut local = self.local_channel.lock().unwrap();
        match (local.as_ref(), enabled) {
            (Some(channel), true) => {
                channel.core().set_status(ConnectionStatus::Active);
            }
            (Some(channel), false) => {
                channel.core().set_status(ConnectionStatus::Disconnected);
            }
            (None, true) => {
                let id = self.registry.next_id();
                let settings = self.channel_settings(
                    "local",
                    self.config.local_priority,
                    self.config.local_max_jobs,
                );
                let channel = Arc::new(LocalChannel::with_thread_pool(
                    id,
                    settings,
                    self.config.default_task_timeout,
                    self.handle.clone(),
                ));
                let as_channel: Arc<dyn Channel> = Arc::clone(&channel) as _;
                self.watch_channel(&as_channel);
                self.registry.add(Arc::clone(&as_channel));
                as_channel.start();
                *local = Some(channel);
            }
            (None, false) => {}
        }
        tracing::debug!("Local execution enabled: {}", enabled);
    }

    pub fn is_local_execution_enabled(&self) -> bool {
        self.local_channel
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |channel| channel.status().is_working())
    }

    /// Validates `submission` and queues the job.
    pub fn submit_job(&self, submission: JobSubmission) -> Result<JobHandle, JobError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(JobError::Closed);
        }
        let job = Job::from_submission(submission)?;
        tracing::debug!(
            "Submitting job {} ('{}') with {} tasks",
            job.uuid(),
            job.name(),
            job.task_count()
        );
        self.queue.add_job(Arc::clone(&job));
        Ok(JobHandle { job })
    }

    /// Cancels the job `uuid`. Returns `false` if it is unknown or already finished.
    pub fn cancel_job(&self, uuid: Uuid) -> bool {
        self.queue.cancel_job(uuid)
    }

    /// Registers a listener notified whenever a job enters or leaves the queue.
    pub fn add_queue_listener(&self, listener: QueueListener) {
        self.queue.add_listener(listener);
    }

    /// Changes the size of the units carved out for every channel.
    pub fn set_bundle_size(&self, bundle_size: usize) {
        self.factory.set_bundle_size(bundle_size);
        self.waker.wake();
    }

    pub fn bundle_size(&self) -> usize {
        self.factory.bundle_size()
    }

    /// The highest priority among the working channels.
    pub fn highest_priority(&self) -> Option<i32> {
        self.registry.highest_priority()
    }

    pub fn channel_status(&self, id: ChannelId) -> Option<ConnectionStatus> {
        self.registry.get(id).map(|channel| channel.status())
    }

    /// Whether the channel `id` is in the working set the dispatch loop draws from.
    pub fn is_channel_working(&self, id: ChannelId) -> bool {
        self.registry.is_working(id)
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<dyn Channel>> {
        self.registry.get(id)
    }

    pub fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.registry.all()
    }

    pub fn codebases(&self) -> &Arc<CodebaseRegistry> {
        &self.codebases
    }

    /// Re-establishes every remote connection, resubmitting what they carried.
    pub fn reset(&self) {
        for channel in self.registry.all() {
            if !channel.is_local() {
                channel.reset();
            }
        }
    }

    /// Cancels the live jobs, closes every channel and stops the runtime.
    pub fn close(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Closing the DispatchManager");
        self.queue.cancel_all();
        for channel in self.registry.all() {
            channel.close();
        }
        self.waker.wake();
        if let Some(task) = self.scheduler_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for DispatchManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// The submitter's view of a job.
#[derive(Clone)]
pub struct JobHandle {
    job: Arc<Job>,
}

impl JobHandle {
    pub fn uuid(&self) -> Uuid {
        self.job.uuid()
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }

    pub fn status(&self) -> SubmissionStatus {
        self.job.submission_status()
    }

    pub fn job_status(&self) -> JobStatus {
        self.job.status()
    }

    pub fn is_done(&self) -> bool {
        self.job.is_done()
    }

    pub fn cancel(&self) -> bool {
        self.job.cancel()
    }

    /// The results received so far, ordered by position.
    pub fn results(&self) -> Vec<TaskResult> {
        self.job.results()
    }

    /// Blocks until the job is done and returns its results, or `None` if `timeout`
    /// elapses first.
    pub fn await_results(&self, timeout: Option<Duration>) -> Option<Vec<TaskResult>> {
        if self.job.await_done(timeout) {
            Some(self.job.results())
        } else {
            None
        }
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }
}
