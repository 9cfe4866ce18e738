#![allow(dead_code)]
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;

use grid_dispatch::{
    job::{JobEvent, JobListener, Task, TaskContext},
    Configuration,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn make_default_config() -> Configuration {
    Configuration::new()
        .with_num_threads(4)
        .with_scheduler_interval(Duration::from_millis(20))
        .with_reconnect_policy(5, Duration::from_millis(10))
        .disable_logger()
}

/// A task returning its position as a string.
pub fn echo_task() -> Task {
    Task::new(|ctx: &TaskContext| Ok(Bytes::from(ctx.position().to_string())))
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Counts the notifications of a job.
#[derive(Default)]
pub struct CountingListener {
    pub dispatched: AtomicUsize,
    pub returned: AtomicUsize,
    pub ended: AtomicUsize,
}

impl CountingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

impl JobListener for CountingListener {
    fn job_dispatched(&self, _event: &JobEvent) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    fn job_returned(&self, event: &JobEvent) {
        self.returned
            .fetch_add(event.results.len(), Ordering::SeqCst);
    }

    fn job_ended(&self, _event: &JobEvent) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}
