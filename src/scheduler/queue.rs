use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, Weak},
};

use uuid::Uuid;

use crate::{
    channel::{Channel, ChannelRegistry},
    job::{DispatchUnit, Job, SubmissionStatus},
};

use super::SchedulerWaker;

/// Jobs ordered by priority, highest first, then by submission order.
type QueueKey = (Reverse<i32>, u64);

#[derive(Default)]
struct QueueState {
    jobs: BTreeMap<QueueKey, Arc<Job>>,
    keys: HashMap<Uuid, QueueKey>,
    /// Broadcast jobs submitted while no remote driver was reachable.
    pending_broadcasts: Vec<Arc<Job>>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, job: Arc<Job>) -> bool {
        if self.keys.contains_key(&job.uuid()) {
            return false;
        }
        let key = (Reverse(job.sla().priority), self.next_seq);
        self.next_seq += 1;
        self.keys.insert(job.uuid(), key);
        self.jobs.insert(key, job);
        true
    }
}

/// A change in the content of a [`JobQueue`].
#[derive(Clone)]
pub enum QueueEvent {
    JobAdded(Arc<Job>),
    JobRemoved(Uuid),
}

pub type QueueListener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// The live jobs of a dispatch manager. A job stays in the queue until it is done.
pub struct JobQueue {
    state: Mutex<QueueState>,
    listeners: Mutex<Vec<QueueListener>>,
    registry: Arc<ChannelRegistry>,
    waker: Arc<SchedulerWaker>,
    me: Weak<JobQueue>,
}

impl JobQueue {
    pub fn new(registry: Arc<ChannelRegistry>, waker: Arc<SchedulerWaker>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(QueueState::default()),
            listeners: Mutex::new(Vec::new()),
            registry,
            waker,
            me: Weak::clone(me),
        })
    }

    pub fn add_listener(&self, listener: QueueListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn notify(&self, event: QueueEvent) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    /// Adds a submitted job. A broadcast job is expanded into one child per driver
    /// reachable through a working remote channel, or kept aside until one is.
    pub fn add_job(&self, job: Arc<Job>) {
        self.attach(&job);
        job.set_submission_status(SubmissionStatus::Pending);
        tracing::debug!(
            "[JobQueue] adding job {} ('{}') with priority {}",
            job.uuid(),
            job.name(),
            job.sla().priority
        );
        self.notify(QueueEvent::JobAdded(Arc::clone(&job)));
        self.state.lock().unwrap().insert(Arc::clone(&job));
        if job.is_broadcast_parent() && !self.expand_broadcast(&job) {
            tracing::debug!("[JobQueue] no driver for broadcast job {} yet", job.uuid());
            self.state.lock().unwrap().pending_broadcasts.push(job);
        }
        self.waker.wake();
    }

    fn attach(&self, job: &Arc<Job>) {
        job.attach_registry(Arc::downgrade(&self.registry));
        let queue = Weak::clone(&self.me);
        job.set_requeue_callback(Arc::new(move |job: &Arc<Job>| {
            if let Some(queue) = queue.upgrade() {
                queue.requeue(job);
            }
        }));
        let queue = Weak::clone(&self.me);
        job.add_done_hook(Box::new(move |job: &Job| {
            if let Some(queue) = queue.upgrade() {
                queue.remove(job.uuid());
            }
        }));
    }

    /// Creates the children of a broadcast job. Returns `false` if there is no driver
    /// to target.
    fn expand_broadcast(&self, parent: &Arc<Job>) -> bool {
        let drivers = self.registry.working_drivers();
        if drivers.is_empty() {
            return false;
        }
        let children: Vec<Arc<Job>> = drivers
            .into_iter()
            .map(|driver| Job::broadcast_child(parent, driver))
            .collect();
        for child in children.iter() {
            self.attach(child);
            child.set_submission_status(SubmissionStatus::Pending);
            self.notify(QueueEvent::JobAdded(Arc::clone(child)));
        }
        let mut state = self.state.lock().unwrap();
        for child in children {
            state.insert(child);
        }
        true
    }

    /// Expands the broadcast jobs waiting for a driver, now that one may be reachable.
    pub fn process_pending_broadcasts(&self) {
        let waiting = std::mem::take(&mut self.state.lock().unwrap().pending_broadcasts);
        if waiting.is_empty() {
            return;
        }
        let mut still_waiting = Vec::new();
        for job in waiting {
            if job.is_done() || job.is_cancelled() {
                continue;
            }
            if !self.expand_broadcast(&job) {
                still_waiting.push(job);
            }
        }
        self.state
            .lock()
            .unwrap()
            .pending_broadcasts
            .extend(still_waiting);
        self.waker.wake();
    }

    /// Makes a job dispatchable again after some of its tasks came back.
    pub fn requeue(&self, job: &Arc<Job>) {
        if job.is_done() {
            return;
        }
        let inserted = self.state.lock().unwrap().insert(Arc::clone(job));
        tracing::debug!(
            "[JobQueue] job {} requeued (already queued: {})",
            job.uuid(),
            !inserted
        );
        self.waker.wake();
    }

    pub fn remove(&self, uuid: Uuid) -> Option<Arc<Job>> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.pending_broadcasts.retain(|job| job.uuid() != uuid);
            let key = state.keys.remove(&uuid)?;
            state.jobs.remove(&key)
        };
        if removed.is_some() {
            self.notify(QueueEvent::JobRemoved(uuid));
        }
        removed
    }

    pub fn get(&self, uuid: Uuid) -> Option<Arc<Job>> {
        let state = self.state.lock().unwrap();
        let key = state.keys.get(&uuid)?;
        state.jobs.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Carves the next unit for `channel` out of the first job, in queue order, that
    /// may run on it.
    pub fn next_unit_for(&self, channel: &dyn Channel, size: usize) -> Option<Arc<DispatchUnit>> {
        let state = self.state.lock().unwrap();
        for job in state.jobs.values() {
            if job.is_done() || job.is_cancelled() || job.is_broadcast_parent() {
                continue;
            }
            if let Some(target) = job.broadcast_target() {
                if channel.driver_uuid() != Some(target) {
                    continue;
                }
            }
            if !job.accepts_channel(channel.id()) {
                continue;
            }
            if let Some(unit) = job.copy(size) {
                return Some(unit);
            }
        }
        None
    }

    /// Cancels the job `uuid`. Returns `false` if it is unknown, done or already
    /// cancelled.
    pub fn cancel_job(&self, uuid: Uuid) -> bool {
        match self.get(uuid) {
            Some(job) => job.cancel(),
            None => false,
        }
    }

    /// Cancels the broadcast children bound to `driver`.
    pub fn cancel_broadcast_jobs(&self, driver: Uuid) -> usize {
        let targets: Vec<Arc<Job>> = self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|job| job.broadcast_target() == Some(driver) && !job.is_done())
            .cloned()
            .collect();
        let mut cancelled = 0;
        for job in targets {
            if job.cancel() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(
                "[JobQueue] cancelled {} broadcast jobs bound to driver {}",
                cancelled,
                driver
            );
        }
        cancelled
    }

    /// Cancels every live job.
    pub fn cancel_all(&self) {
        let jobs: Vec<Arc<Job>> = self.state.lock().unwrap().jobs.values().cloned().collect();
        for job in jobs {
            job.cancel();
        }
    }
}
