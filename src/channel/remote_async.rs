use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use tokio::{
    runtime::Handle,
    sync::{watch, Notify},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    communication::{
        prepare_bundle, CodebaseRegistry, CommunicationError, ManagementClient, ResultBatch,
        TaskServerConnection,
    },
    job::{DispatchError, DispatchUnit},
    BundleId,
};

use super::{
    complete_unit, reconnect, resubmit_unit, wait_for_working, Channel, ChannelCore,
    ConnectionStatus,
};

/// A bundle sent and waiting for its results.
struct PendingResponse {
    unit: Arc<DispatchUnit>,
    expected: usize,
    received: usize,
    started: Instant,
    /// The connection generation the bundle was sent on.
    generation: u64,
}

/// A remote channel pipelining several units over one connection.
///
/// Submitted units wait in a FIFO until the [`BundleSender`] loop sends them. Each sent
/// bundle is registered in the pending table, where the [`ResultReceiver`] loop matches
/// incoming batches against it. Both loops only run while the channel is working.
///
/// A connection failure is handled once per connection generation: the failing unit,
/// every unit still queued, and every bundle waiting for results are resubmitted to
/// their jobs, then the connection is re-established.
pub struct RemoteAsyncChannel {
    core: ChannelCore,
    connection: Arc<dyn TaskServerConnection>,
    codebases: Arc<CodebaseRegistry>,
    management: Option<Arc<dyn ManagementClient>>,
    runtime: Handle,
    outbound: Mutex<VecDeque<Arc<DispatchUnit>>>,
    outbound_notify: Notify,
    pending: Mutex<HashMap<BundleId, PendingResponse>>,
    next_bundle_id: AtomicU64,
    generation: AtomicU64,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteAsyncChannel {
    pub fn new(
        core: ChannelCore,
        connection: Arc<dyn TaskServerConnection>,
        codebases: Arc<CodebaseRegistry>,
        management: Option<Arc<dyn ManagementClient>>,
        runtime: Handle,
    ) -> Self {
        Self {
            core,
            connection,
            codebases,
            management,
            runtime,
            outbound: Mutex::new(VecDeque::new()),
            outbound_notify: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            next_bundle_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Number of units waiting to be sent.
    pub fn queued_count(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }

    /// Number of bundles sent and waiting for results.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn pop_outbound(&self) -> Option<Arc<DispatchUnit>> {
        self.outbound.lock().unwrap().pop_front()
    }

    async fn send_unit(&self, unit: Arc<DispatchUnit>) {
        if unit.is_cancelled() {
            complete_unit(&self.core, &unit, None);
            return;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let bundle_id: BundleId = self.next_bundle_id.fetch_add(1, Ordering::SeqCst);
        for codebase in unit.codebases() {
            self.codebases.register(&codebase, unit.job_uuid());
        }
        let (bundle, rejected) = prepare_bundle(bundle_id, &unit);
        unit.results_received(rejected);
        let expected = bundle.tasks.len();
        if expected == 0 {
            self.finish_unit(&unit, None);
            return;
        }

        // Registered first: results may come back before the send returns.
        self.pending.lock().unwrap().insert(
            bundle_id,
            PendingResponse {
                unit: Arc::clone(&unit),
                expected,
                received: 0,
                started: Instant::now(),
                generation,
            },
        );
        tracing::debug!(
            "[RemoteAsync {}] sending bundle {} of job {} with positions {:?}",
            self.core.id(),
            bundle_id,
            unit.job_uuid(),
            bundle.header.positions
        );
        match self.connection.send_bundle(bundle).await {
            Ok(()) => {
                if self.generation.load(Ordering::SeqCst) != generation {
                    // The failure handler of the previous generation may have drained
                    // the table before the bundle was registered.
                    let orphan = self.pending.lock().unwrap().remove(&bundle_id);
                    if let Some(entry) = orphan {
                        self.codebases.unregister(entry.unit.job_uuid());
                        resubmit_unit(&self.core, &entry.unit);
                    }
                }
            }
            Err(e) if e.is_terminal() => {
                let entry = self.pending.lock().unwrap().remove(&bundle_id);
                if let Some(entry) = entry {
                    tracing::warn!(
                        "[RemoteAsync {}] bundle {} failed: {}",
                        self.core.id(),
                        bundle_id,
                        e
                    );
                    let error = DispatchError::from(e);
                    entry.unit.results_received_error(&error);
                    self.finish_unit(&entry.unit, Some(&error));
                }
            }
            Err(e) => {
                self.handle_failure(Some((bundle_id, unit)), e, generation)
                    .await;
            }
        }
    }

    fn process_batch(&self, batch: ResultBatch) {
        let entry = self.pending.lock().unwrap().remove(&batch.bundle_id);
        let mut entry = match entry {
            Some(entry) => entry,
            None => {
                tracing::debug!(
                    "[RemoteAsync {}] no pending bundle {}, dropping {} results",
                    self.core.id(),
                    batch.bundle_id,
                    batch.results.len()
                );
                return;
            }
        };
        entry.received += batch.results.len();
        entry.unit.results_received(batch.results);
        if entry.received >= entry.expected {
            self.core
                .record_round_trip(entry.expected, entry.started.elapsed());
            self.finish_unit(&entry.unit, None);
            return;
        }

        let unit = {
            let mut pending = self.pending.lock().unwrap();
            if entry.generation == self.generation.load(Ordering::SeqCst) {
                pending.insert(batch.bundle_id, entry);
                return;
            }
            entry.unit
        };
        // The connection failed in the meantime and the rest of the results is lost.
        self.codebases.unregister(unit.job_uuid());
        resubmit_unit(&self.core, &unit);
    }

    fn finish_unit(&self, unit: &DispatchUnit, error: Option<&DispatchError>) {
        self.codebases.unregister(unit.job_uuid());
        complete_unit(&self.core, unit, error);
    }

    /// Handles a connection failure seen by a loop working on `generation`.
    ///
    /// Only the first failure of a generation marks the channel disconnected,
    /// resubmits the queued and pending units and reconnects. A failure from an older
    /// generation only resubmits its own unit and leaves the status alone.
    async fn handle_failure(
        &self,
        trigger: Option<(BundleId, Arc<DispatchUnit>)>,
        error: CommunicationError,
        generation: u64,
    ) {
        if self.core.is_shutting_down() {
            tracing::debug!(
                "[RemoteAsync {}] closing, ignoring {}",
                self.core.id(),
                error
            );
            return;
        }
        let first = self
            .generation
            .compare_exchange(
                generation,
                generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if first {
            self.core.set_status(ConnectionStatus::Disconnected);
        }
        let mut handled = HashSet::new();
        if let Some((bundle_id, unit)) = trigger {
            self.pending.lock().unwrap().remove(&bundle_id);
            self.codebases.unregister(unit.job_uuid());
            resubmit_unit(&self.core, &unit);
            handled.insert(bundle_id);
        }
        if !first {
            tracing::trace!(
                "[RemoteAsync {}] failure of generation {} already handled: {}",
                self.core.id(),
                generation,
                error
            );
            return;
        }
        tracing::warn!(
            "[RemoteAsync {}] connection to {} failed: {}",
            self.core.id(),
            self.connection.name(),
            error
        );

        let queued: Vec<Arc<DispatchUnit>> = self.outbound.lock().unwrap().drain(..).collect();
        let pending: Vec<(BundleId, PendingResponse)> =
            self.pending.lock().unwrap().drain().collect();
        tracing::debug!(
            "[RemoteAsync {}] resubmitting {} queued and {} pending units",
            self.core.id(),
            queued.len(),
            pending.len()
        );
        for unit in queued {
            resubmit_unit(&self.core, &unit);
        }
        for (bundle_id, entry) in pending {
            if handled.contains(&bundle_id) {
                continue;
            }
            self.codebases.unregister(entry.unit.job_uuid());
            resubmit_unit(&self.core, &entry.unit);
        }

        reconnect(&self.core, self.connection.as_ref()).await;
    }
}

/// Sends the queued units while the channel is working.
struct BundleSender {
    channel: Arc<RemoteAsyncChannel>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl BundleSender {
    fn new(channel: Arc<RemoteAsyncChannel>) -> Self {
        let status_rx = channel.core.subscribe();
        Self { channel, status_rx }
    }

    async fn run(&mut self) -> Result<(), CommunicationError> {
        loop {
            wait_for_working(&mut self.status_rx).await?;
            match self.channel.pop_outbound() {
                Some(unit) => self.channel.send_unit(unit).await,
                None => {
                    tokio::select! {
                        _ = self.channel.outbound_notify.notified() => {}
                        changed = self.status_rx.changed() => {
                            changed.map_err(|_| CommunicationError::Closed)?;
                        }
                    }
                }
            }
        }
    }
}

/// Matches incoming result batches with the pending bundles while the channel is
/// working.
struct ResultReceiver {
    channel: Arc<RemoteAsyncChannel>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl ResultReceiver {
    fn new(channel: Arc<RemoteAsyncChannel>) -> Self {
        let status_rx = channel.core.subscribe();
        Self { channel, status_rx }
    }

    async fn run(&mut self) -> Result<(), CommunicationError> {
        loop {
            wait_for_working(&mut self.status_rx).await?;
            let generation = self.channel.generation.load(Ordering::SeqCst);
            match self.channel.connection.receive_results().await {
                Ok(batch) => self.channel.process_batch(batch),
                Err(e) if e.is_terminal() => {
                    tracing::warn!(
                        "[RemoteAsync {}] failed to receive results: {}",
                        self.channel.core.id(),
                        e
                    );
                }
                Err(e) => {
                    self.channel
                        .handle_failure(None, e, generation)
                        .await
                }
            }
        }
    }
}

impl Channel for RemoteAsyncChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn start(self: Arc<Self>) {
        let id = self.core.id();
        let mut sender = BundleSender::new(Arc::clone(&self));
        let mut receiver = ResultReceiver::new(Arc::clone(&self));
        let sender_handle = self.runtime.spawn(async move {
            if let Err(e) = sender.run().await {
                tracing::debug!("[RemoteAsync {}] sender stopped: {}", id, e);
            }
        });
        let receiver_handle = self.runtime.spawn(async move {
            if let Err(e) = receiver.run().await {
                tracing::debug!("[RemoteAsync {}] receiver stopped: {}", id, e);
            }
        });
        self.loops
            .lock()
            .unwrap()
            .extend(vec![sender_handle, receiver_handle]);

        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            reconnect(&self.core, self.connection.as_ref()).await;
        });
    }

    fn submit(self: Arc<Self>, unit: Arc<DispatchUnit>) {
        tracing::trace!(
            "[RemoteAsync {}] queueing unit {} of job {}",
            self.core.id(),
            unit.id(),
            unit.job_uuid()
        );
        self.outbound.lock().unwrap().push_back(unit);
        self.outbound_notify.notify_one();
    }

    /// Removes `unit` from the queue or from the pending table and completes it.
    /// Results already received are kept; the other tasks complete empty.
    fn cancel(&self, unit: &DispatchUnit) -> bool {
        let queued = {
            let mut outbound = self.outbound.lock().unwrap();
            outbound
                .iter()
                .position(|queued| queued.id() == unit.id())
                .and_then(|index| outbound.remove(index))
        };
        if let Some(queued) = queued {
            complete_unit(&self.core, &queued, None);
            return true;
        }
        let entry = {
            let mut pending = self.pending.lock().unwrap();
            let bundle_id = pending
                .iter()
                .find(|(_, entry)| entry.unit.id() == unit.id())
                .map(|(bundle_id, _)| *bundle_id);
            bundle_id.and_then(|bundle_id| pending.remove(&bundle_id))
        };
        match entry {
            Some(entry) => {
                self.finish_unit(&entry.unit, None);
                true
            }
            None => false,
        }
    }

    fn is_local(&self) -> bool {
        false
    }

    fn is_asynchronous(&self) -> bool {
        true
    }

    fn driver_uuid(&self) -> Option<Uuid> {
        Some(self.connection.driver_uuid())
    }

    fn management(&self) -> Option<Arc<dyn ManagementClient>> {
        self.management.clone()
    }

    fn reset(self: Arc<Self>) {
        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            self.core.set_resetting(true);
            let generation = self.generation.load(Ordering::SeqCst);
            self.connection.close().await;
            self.handle_failure(None, CommunicationError::Closed, generation)
                .await;
            self.core.set_resetting(false);
        });
    }

    /// Stops both loops and drops whatever was queued or pending.
    fn close(&self) {
        self.core.set_closing();
        self.core.set_status(ConnectionStatus::Closed);
        for handle in self.loops.lock().unwrap().drain(..) {
            handle.abort();
        }
        let queued = self.outbound.lock().unwrap().len();
        let pending = self.pending.lock().unwrap().len();
        self.outbound.lock().unwrap().clear();
        self.pending.lock().unwrap().clear();
        if queued + pending > 0 {
            tracing::debug!(
                "[RemoteAsync {}] closed with {} queued and {} pending units",
                self.core.id(),
                queued,
                pending
            );
        }
        let connection = Arc::clone(&self.connection);
        self.runtime.spawn(async move {
            connection.close().await;
        });
    }
}
