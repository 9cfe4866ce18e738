use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::{
    job::{TaskContext, TaskGraph, TaskResult},
    BundleId,
};

use super::{BundleHeader, CommunicationError, OutboundBundle, ResultBatch, TaskServerConnection};

/// A delivery on the result stream, tagged with the generation of the connection that
/// produced it.
type Delivery = (u64, Result<ResultBatch, CommunicationError>);

struct LoopbackState {
    connected: AtomicBool,
    holding: AtomicBool,
    generation: AtomicU64,
    send_failures: AtomicUsize,
    send_stalls: AtomicUsize,
    stalled: AtomicUsize,
    connect_failures: AtomicUsize,
    held: Mutex<Vec<Delivery>>,
    sent: Mutex<Vec<BundleHeader>>,
    results_tx: UnboundedSender<Delivery>,
}

impl LoopbackState {
    fn deliver(&self, delivery: Delivery) {
        if delivery.0 != self.generation.load(Ordering::SeqCst) {
            return;
        }
        if self.holding.load(Ordering::SeqCst) {
            self.held.lock().unwrap().push(delivery);
        } else if self.results_tx.send(delivery).is_err() {
            tracing::trace!("Loopback result stream closed, dropping results");
        }
    }
}

/// An in-process compute server.
///
/// Bundles are executed on the blocking pool of the current tokio runtime, in an order
/// compatible with the dependencies carried by their header, and the results are
/// streamed back in batches of at most `batch_size` results. The connection can be
/// told to fail, and to hold results until released, which makes it a convenient fake
/// server in tests.
///
/// Every reconnection starts a new generation: results produced for a previous
/// generation are discarded.
pub struct LoopbackConnection {
    driver_uuid: Uuid,
    name: String,
    batch_size: usize,
    task_delay: Option<Duration>,
    state: Arc<LoopbackState>,
    results_rx: tokio::sync::Mutex<UnboundedReceiver<Delivery>>,
}

impl LoopbackConnection {
    pub fn new(name: &str, driver_uuid: Uuid) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            driver_uuid,
            name: name.to_string(),
            batch_size: usize::MAX,
            task_delay: None,
            state: Arc::new(LoopbackState {
                connected: AtomicBool::new(false),
                holding: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                send_failures: AtomicUsize::new(0),
                send_stalls: AtomicUsize::new(0),
                stalled: AtomicUsize::new(0),
                connect_failures: AtomicUsize::new(0),
                held: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                results_tx,
            }),
            results_rx: tokio::sync::Mutex::new(results_rx),
        }
    }

    /// Splits the results of a bundle into batches of at most `batch_size` results.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sleeps for `delay` before executing each task.
    pub fn with_task_delay(mut self, delay: Duration) -> Self {
        self.task_delay = Some(delay);
        self
    }

    /// The next `count` sends fail and break the connection.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.send_failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` sends hang until the connection is re-established, then fail
    /// as if the old connection had broken under them.
    pub fn stall_next_sends(&self, count: usize) {
        self.state.send_stalls.store(count, Ordering::SeqCst);
    }

    /// Number of sends currently hanging.
    pub fn stalled_count(&self) -> usize {
        self.state.stalled.load(Ordering::SeqCst)
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Breaks the connection: the pending receive fails and results still being
    /// computed are lost.
    pub fn break_connection(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        let generation = self.state.generation.load(Ordering::SeqCst);
        self.state.held.lock().unwrap().clear();
        let error = CommunicationError::IoError(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "loopback connection broken",
        ));
        let sent = self.state.results_tx.send((generation, Err(error)));
        if sent.is_err() {
            tracing::trace!("[Loopback {}] result stream closed", self.name);
        }
    }

    /// Keeps results back until [`LoopbackConnection::release_held`] is called.
    pub fn hold_results(&self) {
        self.state.holding.store(true, Ordering::SeqCst);
    }

    /// Delivers every held result and stops holding.
    pub fn release_held(&self) {
        self.state.holding.store(false, Ordering::SeqCst);
        let held = std::mem::take(&mut *self.state.held.lock().unwrap());
        for delivery in held {
            self.state.deliver(delivery);
        }
    }

    /// Number of result batches currently held back.
    pub fn held_count(&self) -> usize {
        self.state.held.lock().unwrap().len()
    }

    /// Headers of every bundle received, in arrival order.
    pub fn sent_bundles(&self) -> Vec<BundleHeader> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn execute(bundle: OutboundBundle, task_delay: Option<Duration>) -> Vec<TaskResult> {
        let OutboundBundle {
            header,
            tasks,
            data_provider,
        } = bundle;
        let mut graph = TaskGraph::new();
        for position in header.positions.iter() {
            graph.add_node(*position);
        }
        for (predecessor, successor) in header.dependencies.iter() {
            graph.add_dependency(*predecessor, *successor);
        }
        let order = graph
            .topological_order()
            .unwrap_or_else(|_| header.positions.clone());

        let cancelled = Arc::new(AtomicBool::new(false));
        let mut results = Vec::with_capacity(tasks.len());
        for position in order {
            if let Some(task) = tasks.iter().find(|task| task.position() == position) {
                if let Some(delay) = task_delay {
                    std::thread::sleep(delay);
                }
                let context = TaskContext::new(
                    header.job_uuid,
                    position,
                    data_provider.clone(),
                    Arc::clone(&cancelled),
                );
                results.push(task.execute(&context));
            }
        }
        results
    }
}

#[async_trait]
impl TaskServerConnection for LoopbackConnection {
    fn driver_uuid(&self) -> Uuid {
        self.driver_uuid
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self) -> Result<(), CommunicationError> {
        let remaining = self.state.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(CommunicationError::IoError(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "loopback refused the connection",
            )));
        }
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.held.lock().unwrap().clear();
        self.state.connected.store(true, Ordering::SeqCst);
        tracing::trace!(
            "[Loopback {}] connected, generation {}",
            self.name,
            generation
        );
        Ok(())
    }

    async fn send_bundle(&self, bundle: OutboundBundle) -> Result<(), CommunicationError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(CommunicationError::Disconnected);
        }
        let stalls = self.state.send_stalls.load(Ordering::SeqCst);
        if stalls > 0 {
            self.state.send_stalls.store(stalls - 1, Ordering::SeqCst);
            let generation = self.state.generation.load(Ordering::SeqCst);
            self.state.stalled.fetch_add(1, Ordering::SeqCst);
            while self.state.generation.load(Ordering::SeqCst) == generation {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.state.stalled.fetch_sub(1, Ordering::SeqCst);
            return Err(CommunicationError::IoError(io::Error::new(
                io::ErrorKind::TimedOut,
                "loopback send timed out on a replaced connection",
            )));
        }
        let remaining = self.state.send_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .send_failures
                .store(remaining - 1, Ordering::SeqCst);
            self.break_connection();
            return Err(CommunicationError::IoError(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "loopback failed to send the bundle",
            )));
        }
        self.state.sent.lock().unwrap().push(bundle.header.clone());

        let generation = self.state.generation.load(Ordering::SeqCst);
        let bundle_id: BundleId = bundle.header.bundle_id;
        let batch_size = self.batch_size;
        let task_delay = self.task_delay;
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let outcome =
                tokio::task::spawn_blocking(move || Self::execute(bundle, task_delay)).await;
            match outcome {
                Ok(results) => {
                    for chunk in results.chunks(batch_size) {
                        state.deliver((
                            generation,
                            Ok(ResultBatch {
                                bundle_id,
                                results: chunk.to_vec(),
                            }),
                        ));
                    }
                }
                Err(e) => state.deliver((generation, Err(CommunicationError::from(e)))),
            }
        });
        Ok(())
    }

    async fn receive_results(&self) -> Result<ResultBatch, CommunicationError> {
        let mut results_rx = self.results_rx.lock().await;
        loop {
            let (generation, delivery) = results_rx
                .recv()
                .await
                .ok_or(CommunicationError::Closed)?;
            if generation == self.state.generation.load(Ordering::SeqCst) {
                return delivery;
            }
            tracing::trace!(
                "[Loopback {}] discarding a delivery from generation {}",
                self.name,
                generation
            );
        }
    }

    async fn close(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        let generation = self.state.generation.load(Ordering::SeqCst);
        let _ = self
            .state
            .results_tx
            .send((generation, Err(CommunicationError::Closed)));
    }
}
