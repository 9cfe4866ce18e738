//! Execution channels: where dispatch units run.
//!
//! Every channel kind shares one [`ChannelCore`] holding the connection status
//! machine, the status listeners, the load-balancer slot and the unit accounting. The
//! kinds differ only in how a unit travels: [`LocalChannel`] runs it in-process,
//! [`RemoteSyncChannel`] does one blocking round trip per unit, and
//! [`RemoteAsyncChannel`] pipelines sends and receives over one connection.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    communication::{CommunicationError, ManagementClient, TaskServerConnection},
    job::{DispatchError, DispatchUnit},
    load_balancer::{Bundler, BundlerFactory, LoadBalancerPersistence, NoopPersistence},
    scheduler::SchedulerWaker,
    ChannelId,
};

// Private submodules
mod local;
mod registry;
mod remote_async;
mod remote_sync;

// Public exports
pub use local::{ExecutionManager, LocalChannel, ThreadPoolExecutionManager};
pub use registry::ChannelRegistry;
pub use remote_async::RemoteAsyncChannel;
pub use remote_sync::RemoteSyncChannel;

static CHANNEL_NAMESPACE: Lazy<Uuid> =
    Lazy::new(|| Uuid::new_v5(&Uuid::NAMESPACE_OID, b"grid-dispatch.channel"));

/// Status of the connection behind a channel. `Failed` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    New,
    Connecting,
    Active,
    Executing,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionStatus {
    /// Statuses in which a channel can execute units.
    pub fn is_working(&self) -> bool {
        matches!(self, ConnectionStatus::Active | ConnectionStatus::Executing)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, ConnectionStatus::Failed | ConnectionStatus::Closed)
    }
}

/// Status of a channel seen as a generic executor, derived from its [`ConnectionStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutorStatus {
    Active,
    Executing,
    Failed,
    Disabled,
}

impl From<ConnectionStatus> for ExecutorStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Active => ExecutorStatus::Active,
            ConnectionStatus::Executing => ExecutorStatus::Executing,
            ConnectionStatus::Failed | ConnectionStatus::Closed => ExecutorStatus::Failed,
            ConnectionStatus::New
            | ConnectionStatus::Connecting
            | ConnectionStatus::Disconnected => ExecutorStatus::Disabled,
        }
    }
}

/// A status transition of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange<S> {
    pub channel: ChannelId,
    pub old: S,
    pub new: S,
}

pub type ConnectionStatusListener = Arc<dyn Fn(&StatusChange<ConnectionStatus>) + Send + Sync>;
pub type ExecutorStatusListener = Arc<dyn Fn(&StatusChange<ExecutorStatus>) + Send + Sync>;

/// Construction parameters shared by every channel kind.
#[derive(Clone)]
pub struct ChannelSettings {
    pub name: String,
    pub priority: i32,
    /// The number of units the channel executes at the same time.
    pub max_jobs: usize,
    pub factory: Arc<dyn BundlerFactory>,
    pub persistence: Arc<dyn LoadBalancerPersistence>,
    pub waker: Option<Arc<SchedulerWaker>>,
    pub reconnect_attempts: usize,
    pub reconnect_interval: Duration,
}

impl ChannelSettings {
    pub fn new(name: &str, factory: Arc<dyn BundlerFactory>) -> Self {
        Self {
            name: name.to_string(),
            priority: 0,
            max_jobs: 1,
            factory,
            persistence: Arc::new(NoopPersistence),
            waker: None,
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_millis(50),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn LoadBalancerPersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_waker(mut self, waker: Arc<SchedulerWaker>) -> Self {
        self.waker = Some(waker);
        self
    }

    pub fn with_reconnect_policy(mut self, attempts: usize, interval: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_interval = interval;
        self
    }
}

/// State and plumbing shared by all channel kinds.
pub struct ChannelCore {
    id: ChannelId,
    name: String,
    priority: i32,
    max_jobs: usize,
    status: Mutex<ConnectionStatus>,
    status_tx: watch::Sender<ConnectionStatus>,
    connection_listeners: Mutex<Vec<ConnectionStatusListener>>,
    executor_listeners: Mutex<Vec<ExecutorStatusListener>>,
    factory: Arc<dyn BundlerFactory>,
    persistence: Arc<dyn LoadBalancerPersistence>,
    bundler: Mutex<Option<Arc<dyn Bundler>>>,
    identity: Mutex<Option<String>>,
    job_count: AtomicUsize,
    closing: AtomicBool,
    resetting: AtomicBool,
    reconnecting: AtomicBool,
    waker: Option<Arc<SchedulerWaker>>,
    reconnect_attempts: usize,
    reconnect_interval: Duration,
}

impl ChannelCore {
    pub fn new(id: ChannelId, settings: ChannelSettings) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::New);
        Self {
            id,
            name: settings.name,
            priority: settings.priority,
            max_jobs: settings.max_jobs.max(1),
            status: Mutex::new(ConnectionStatus::New),
            status_tx,
            connection_listeners: Mutex::new(Vec::new()),
            executor_listeners: Mutex::new(Vec::new()),
            factory: settings.factory,
            persistence: settings.persistence,
            bundler: Mutex::new(None),
            identity: Mutex::new(None),
            job_count: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            resetting: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            waker: settings.waker,
            reconnect_attempts: settings.reconnect_attempts,
            reconnect_interval: settings.reconnect_interval,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// Number of units currently executing on the channel.
    pub fn job_count(&self) -> usize {
        self.job_count.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    /// A channel is idle when it is active and has room for another unit.
    pub fn is_idle(&self) -> bool {
        self.status() == ConnectionStatus::Active && self.job_count() < self.max_jobs
    }

    /// Sets the status and notifies the listeners. Setting the current status, or any
    /// status once a terminal one is reached, does nothing. Returns whether the status
    /// changed.
    pub fn set_status(&self, new: ConnectionStatus) -> bool {
        self.update_status(None, new)
    }

    /// Sets the status to `new` only if it currently is `expected`.
    pub fn transition(&self, expected: ConnectionStatus, new: ConnectionStatus) -> bool {
        self.update_status(Some(expected), new)
    }

    fn update_status(&self, expected: Option<ConnectionStatus>, new: ConnectionStatus) -> bool {
        let old = {
            let mut status = self.status.lock().unwrap();
            let old = *status;
            if old == new || old.is_terminated() || expected.map_or(false, |e| e != old) {
                return false;
            }
            *status = new;
            old
        };
        // Wakes up every loop gated on the status, whichever status it waits for.
        self.status_tx.send_replace(new);
        tracing::trace!("[Channel {}] status {:?} -> {:?}", self.id, old, new);

        let change = StatusChange {
            channel: self.id,
            old,
            new,
        };
        let listeners = self.connection_listeners.lock().unwrap().clone();
        for listener in listeners {
            listener(&change);
        }
        let (old_executor, new_executor) = (ExecutorStatus::from(old), ExecutorStatus::from(new));
        if old_executor != new_executor {
            let change = StatusChange {
                channel: self.id,
                old: old_executor,
                new: new_executor,
            };
            let listeners = self.executor_listeners.lock().unwrap().clone();
            for listener in listeners {
                listener(&change);
            }
        }
        true
    }

    /// A receiver observing every status change, used to gate channel loops.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn add_connection_status_listener(&self, listener: ConnectionStatusListener) {
        self.connection_listeners.lock().unwrap().push(listener);
    }

    pub fn add_executor_status_listener(&self, listener: ExecutorStatusListener) {
        self.executor_listeners.lock().unwrap().push(listener);
    }

    /// The channel's bundler, replaced first if the factory settings changed since it
    /// was created.
    pub fn bundler(&self) -> Arc<dyn Bundler> {
        let mut slot = self.bundler.lock().unwrap();
        if let Some(bundler) = slot.as_ref() {
            if bundler.timestamp() >= self.factory.last_update_time() {
                return Arc::clone(bundler);
            }
        }
        if let Some(stale) = slot.take() {
            tracing::debug!("[Channel {}] replacing a stale bundler", self.id);
            stale.dispose();
        }
        let fresh: Arc<dyn Bundler> = Arc::from(self.factory.new_bundler());
        *slot = Some(Arc::clone(&fresh));
        fresh
    }

    /// Computes the identity hash under which the load-balancer state is persisted.
    pub fn init_channel_id(&self, driver: Option<Uuid>) -> String {
        let driver = match driver {
            Some(uuid) => uuid.to_string(),
            None => "local".to_string(),
        };
        let key = format!("{}|{}", self.name, driver);
        let identity = Uuid::new_v5(&CHANNEL_NAMESPACE, key.as_bytes()).to_string();
        *self.identity.lock().unwrap() = Some(identity.clone());
        identity
    }

    pub fn identity(&self) -> Option<String> {
        self.identity.lock().unwrap().clone()
    }

    /// Feeds a round trip to the bundler and persists its state.
    pub fn record_round_trip(&self, task_count: usize, elapsed: Duration) {
        let bundler = self.bundler();
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        bundler.feedback(task_count, nanos);
        let identity = self
            .identity()
            .unwrap_or_else(|| self.init_channel_id(None));
        self.persistence
            .store_bundler(&identity, bundler.as_ref(), &self.factory.algorithm_name());
    }

    /// Accounts for a unit handed to the channel.
    pub fn unit_started(&self) {
        let count = self.job_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.max_jobs {
            self.transition(ConnectionStatus::Active, ConnectionStatus::Executing);
        }
    }

    /// Accounts for a unit that left the channel, and wakes the dispatch loop.
    pub fn unit_finished(&self) {
        let previous = self
            .job_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0);
        if previous.saturating_sub(1) < self.max_jobs {
            self.transition(ConnectionStatus::Executing, ConnectionStatus::Active);
        }
        self.wake();
    }

    pub fn wake(&self) {
        if let Some(waker) = self.waker.as_ref() {
            waker.wake();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::SeqCst)
    }

    pub fn set_resetting(&self, resetting: bool) {
        self.resetting.store(resetting, Ordering::SeqCst);
    }

    /// Failures are dropped while the channel is being closed for good.
    fn is_shutting_down(&self) -> bool {
        self.is_closing() && !self.is_resetting()
    }
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("status", &self.status())
            .field("job_count", &self.job_count())
            .finish()
    }
}

/// An execution target for dispatch units.
pub trait Channel: Send + Sync {
    fn core(&self) -> &ChannelCore;

    /// Starts the channel: connects it and spawns whatever it runs on.
    fn start(self: Arc<Self>);

    /// Hands `unit` to the channel. The outcome comes back through the unit's callbacks.
    fn submit(self: Arc<Self>, unit: Arc<DispatchUnit>);

    /// Cancels `unit` if the channel holds it. Returns whether it did.
    fn cancel(&self, unit: &DispatchUnit) -> bool;

    fn is_local(&self) -> bool;

    fn is_asynchronous(&self) -> bool;

    /// The driver behind a remote channel.
    fn driver_uuid(&self) -> Option<Uuid> {
        None
    }

    fn management(&self) -> Option<Arc<dyn ManagementClient>> {
        None
    }

    /// Drops the connection and establishes it again, resubmitting what it carried.
    fn reset(self: Arc<Self>) {}

    /// Closes the channel for good.
    fn close(&self);

    fn id(&self) -> ChannelId {
        self.core().id()
    }

    fn status(&self) -> ConnectionStatus {
        self.core().status()
    }
}

/// Completes `unit` on behalf of a channel, releasing its slot if the unit was not
/// completed already.
pub(crate) fn complete_unit(
    core: &ChannelCore,
    unit: &DispatchUnit,
    error: Option<&DispatchError>,
) {
    if unit.task_completed(error) {
        core.unit_finished();
    }
}

/// Returns the unresolved tasks of `unit` to its job, at most once per unit.
pub(crate) fn resubmit_unit(core: &ChannelCore, unit: &DispatchUnit) -> bool {
    if unit.resubmit() {
        tracing::debug!(
            "[Channel {}] resubmitting unit {} of job {}",
            core.id(),
            unit.id(),
            unit.job_uuid()
        );
        complete_unit(core, unit, None);
        true
    } else {
        false
    }
}

/// Waits until the status allows the channel loops to proceed. Fails once the channel
/// reaches a terminal status.
pub(crate) async fn wait_for_working(
    status_rx: &mut watch::Receiver<ConnectionStatus>,
) -> Result<(), CommunicationError> {
    loop {
        let status = *status_rx.borrow_and_update();
        if status.is_working() {
            return Ok(());
        }
        if status.is_terminated() {
            return Err(CommunicationError::Closed);
        }
        status_rx
            .changed()
            .await
            .map_err(|_| CommunicationError::Closed)?;
    }
}

/// (Re)establishes the connection of a remote channel:
/// DISCONNECTED -> CONNECTING -> ACTIVE, or FAILED once the attempts are exhausted.
/// Only one reconnection runs at a time; a concurrent call returns `false` at once.
pub(crate) async fn reconnect(core: &ChannelCore, connection: &dyn TaskServerConnection) -> bool {
    loop {
        if core.is_shutting_down() || core.reconnecting.swap(true, Ordering::SeqCst) {
            return false;
        }
        let connected = connect_with_retries(core, connection).await;
        core.reconnecting.store(false, Ordering::SeqCst);
        // A failure seen while connecting was left to this call.
        if !connected || core.status() != ConnectionStatus::Disconnected {
            return connected;
        }
    }
}

async fn connect_with_retries(core: &ChannelCore, connection: &dyn TaskServerConnection) -> bool {
    core.set_status(ConnectionStatus::Disconnected);
    core.set_status(ConnectionStatus::Connecting);
    let attempts = core.reconnect_attempts.max(1);
    for attempt in 1..=attempts {
        match connection.connect().await {
            Ok(()) => {
                tracing::debug!(
                    "[Channel {}] connected to {} (driver {})",
                    core.id(),
                    connection.name(),
                    connection.driver_uuid()
                );
                core.set_status(ConnectionStatus::Active);
                return true;
            }
            Err(e) => {
                tracing::warn!(
                    "[Channel {}] connection attempt {}/{} to {} failed: {}",
                    core.id(),
                    attempt,
                    attempts,
                    connection.name(),
                    e
                );
            }
        }
        if core.is_shutting_down() {
            return false;
        }
        if attempt < attempts {
            tokio::time::sleep(core.reconnect_interval).await;
        }
    }
    tracing::error!("[Channel {}] giving up on {}", core.id(), connection.name());
    core.set_status(ConnectionStatus::Failed);
    false
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::load_balancer::FixedSizeBundlerFactory;

    fn make_core(factory: Arc<FixedSizeBundlerFactory>) -> ChannelCore {
        ChannelCore::new(7, ChannelSettings::new("test", factory).with_max_jobs(2))
    }

    /// Test that repeated and post-terminal status changes are dropped.
    #[test]
    fn test_status_machine() {
        let core = make_core(Arc::new(FixedSizeBundlerFactory::new(1)));
        let changes = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&changes);
        core.add_connection_status_listener(Arc::new(move |change| {
            recorded.lock().unwrap().push((change.old, change.new));
        }));

        assert!(core.set_status(ConnectionStatus::Active));
        assert!(
            !core.set_status(ConnectionStatus::Active),
            "Same status is a no-op."
        );
        assert!(
            !core.transition(ConnectionStatus::Executing, ConnectionStatus::Active)
        );
        assert!(core.set_status(ConnectionStatus::Closed));
        assert!(
            !core.set_status(ConnectionStatus::Active),
            "A terminal status cannot be left."
        );
        assert_eq!(
            *changes.lock().unwrap(),
            vec![
                (ConnectionStatus::New, ConnectionStatus::Active),
                (ConnectionStatus::Active, ConnectionStatus::Closed),
            ]
        );
    }

    /// Test that executor listeners only see changes of the derived status.
    #[test]
    fn test_executor_status_is_derived() {
        let core = make_core(Arc::new(FixedSizeBundlerFactory::new(1)));
        let notifications = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notifications);
        core.add_executor_status_listener(Arc::new(move |_change| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        // NEW -> CONNECTING -> DISCONNECTED are all DISABLED for an executor.
        core.set_status(ConnectionStatus::Connecting);
        core.set_status(ConnectionStatus::Disconnected);
        assert_eq!(notifications.load(Ordering::SeqCst), 0);
        core.set_status(ConnectionStatus::Active);
        core.set_status(ConnectionStatus::Failed);
        assert_eq!(notifications.load(Ordering::SeqCst), 2);
    }

    /// Test that the channel is executing while it has no room for another unit.
    #[test]
    fn test_unit_accounting() {
        let core = make_core(Arc::new(FixedSizeBundlerFactory::new(1)));
        core.set_status(ConnectionStatus::Active);
        core.unit_started();
        assert!(core.is_idle(), "One slot is still free.");
        core.unit_started();
        assert_eq!(core.status(), ConnectionStatus::Executing);
        assert!(!core.is_idle());
        core.unit_finished();
        assert_eq!(core.status(), ConnectionStatus::Active);
        core.unit_finished();
        core.unit_finished();
        assert_eq!(core.job_count(), 0, "The count never goes below zero.");
    }

    /// Test that a stale bundler is replaced, and a fresh one kept.
    #[test]
    fn test_bundler_freshness() {
        let factory = Arc::new(FixedSizeBundlerFactory::new(3));
        let core = make_core(Arc::clone(&factory));
        let first = core.bundler();
        let again = core.bundler();
        assert!(Arc::ptr_eq(&first, &again), "A fresh bundler is kept.");
        assert_eq!(first.bundle_size(), 3);

        factory.set_bundle_size(5);
        let replaced = core.bundler();
        assert!(!Arc::ptr_eq(&first, &replaced));
        assert_eq!(replaced.bundle_size(), 5);
    }

    /// Test that the identity hash is stable for a name and driver.
    #[test]
    fn test_identity_hash() {
        let core = make_core(Arc::new(FixedSizeBundlerFactory::new(1)));
        let driver = Uuid::new_v4();
        let first = core.init_channel_id(Some(driver));
        let second = core.init_channel_id(Some(driver));
        assert_eq!(first, second);
        assert_ne!(first, core.init_channel_id(None));
        assert_eq!(core.identity(), Some(core.init_channel_id(None)));
    }
}
