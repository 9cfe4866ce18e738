use std::time::Duration;

use tracing::Level;

/// The configuration parameters of a [`DispatchManager`](crate::DispatchManager).
#[derive(Clone, Debug)]
pub struct Configuration {
    /// The number of OS threads the dispatch runtime will use.
    pub num_threads: usize,
    /// Whether a local channel executing tasks in-process is created on startup.
    pub local_execution_enabled: bool,
    /// The priority of the local channel.
    pub local_priority: i32,
    /// The number of dispatch units the local channel executes concurrently.
    pub local_max_jobs: usize,
    /// The initial size of the units carved out of jobs by the fixed-size load balancer.
    pub bundle_size: usize,
    /// How many times a broken remote connection is re-established before the
    /// channel is marked as failed.
    pub reconnect_attempts: usize,
    /// The pause between two reconnection attempts.
    pub reconnect_interval: Duration,
    /// The longest time the dispatch loop sleeps without being woken up.
    pub scheduler_interval: Duration,
    /// The timeout applied to locally executed tasks which do not declare their own.
    pub default_task_timeout: Option<Duration>,
    /// The logging level of the logger initialized by the manager.
    /// If `None`, no logger is initialized.
    /// Defaults to [`Level::DEBUG`] when compiling in debug mode,
    /// [`Level::INFO`] when compiling in release mode.
    pub logging_level: Option<Level>,
}

impl Configuration {
    /// Creates a configuration with local execution disabled and a bundle size of 1.
    pub fn new() -> Self {
        let log_level = if cfg!(debug_assertions) {
            Some(Level::DEBUG)
        } else {
            Some(Level::INFO)
        };
        Self {
            num_threads: 4,
            local_execution_enabled: false,
            local_priority: 0,
            local_max_jobs: 1,
            bundle_size: 1,
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_millis(50),
            scheduler_interval: Duration::from_millis(100),
            default_task_timeout: None,
            logging_level: log_level,
        }
    }

    /// Sets the number of runtime threads.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    /// Enables or disables the local channel.
    pub fn with_local_execution(mut self, enabled: bool) -> Self {
        self.local_execution_enabled = enabled;
        self
    }

    /// Sets the priority and concurrency of the local channel.
    pub fn with_local_channel(mut self, priority: i32, max_jobs: usize) -> Self {
        self.local_priority = priority;
        self.local_max_jobs = max_jobs.max(1);
        self
    }

    /// Sets the initial bundle size of the load balancer.
    pub fn with_bundle_size(mut self, bundle_size: usize) -> Self {
        self.bundle_size = bundle_size.max(1);
        self
    }

    /// Sets the reconnection policy of remote channels.
    pub fn with_reconnect_policy(mut self, attempts: usize, interval: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_interval = interval;
        self
    }

    /// Sets the idle wake-up interval of the dispatch loop.
    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    /// Sets the default timeout of locally executed tasks.
    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = Some(timeout);
        self
    }

    /// Sets the logging level.
    pub fn with_logging_level(mut self, level: Level) -> Self {
        self.logging_level = Some(level);
        self
    }

    /// The manager will not initialize a logger if this method is called.
    pub fn disable_logger(mut self) -> Self {
        self.logging_level = None;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
