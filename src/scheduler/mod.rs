//! Matches queued jobs with idle channels.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::seq::SliceRandom;
use tokio::sync::Notify;

use crate::{
    channel::{Channel, ChannelRegistry},
    job::DispatchUnit,
};

// Private submodules
mod queue;

// Public exports
pub use queue::{JobQueue, QueueEvent, QueueListener};

/// Wakes the dispatch loop up when a job is added or a channel frees up.
#[derive(Debug, Default)]
pub struct SchedulerWaker {
    notify: Notify,
}

impl SchedulerWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Waits for a wake-up, or for `timeout` to elapse.
    pub async fn wait(&self, timeout: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

/// The dispatch loop: hands units carved out of the queued jobs to the idle channels
/// of the highest working priority.
pub struct JobScheduler {
    queue: Arc<JobQueue>,
    registry: Arc<ChannelRegistry>,
    waker: Arc<SchedulerWaker>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl JobScheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: Arc<ChannelRegistry>,
        waker: Arc<SchedulerWaker>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue,
            registry,
            waker,
            interval,
            shutdown,
        }
    }

    pub async fn run(&self) {
        tracing::debug!("[JobScheduler] dispatch loop started");
        while !self.shutdown.load(Ordering::SeqCst) {
            let dispatched = self.dispatch_round();
            if dispatched > 0 {
                tracing::trace!("[JobScheduler] dispatched {} units", dispatched);
            }
            self.waker.wait(self.interval).await;
        }
        tracing::debug!("[JobScheduler] dispatch loop stopped");
    }

    /// Dispatches units until no idle channel gets one. Idle channels are served in a
    /// random order so that no channel of a priority is favoured.
    pub fn dispatch_round(&self) -> usize {
        let mut dispatched = 0;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let mut idle = self.registry.idle_channels();
            if idle.is_empty() {
                break;
            }
            idle.shuffle(&mut rand::thread_rng());
            let mut progress = false;
            for channel in idle {
                if !channel.core().is_idle() {
                    continue;
                }
                let size = channel.core().bundler().bundle_size();
                if let Some(unit) = self.queue.next_unit_for(channel.as_ref(), size) {
                    dispatch(channel, unit);
                    dispatched += 1;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        dispatched
    }
}

/// Hands `unit` to `channel`.
pub fn dispatch(channel: Arc<dyn Channel>, unit: Arc<DispatchUnit>) {
    tracing::debug!(
        "[JobScheduler] unit {} of job {} ({} tasks) to channel {}",
        unit.id(),
        unit.job_uuid(),
        unit.task_count(),
        channel.id()
    );
    channel.core().unit_started();
    unit.job_dispatched(channel.id());
    channel.submit(unit);
}
