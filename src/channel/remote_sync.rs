use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use tokio::runtime::Handle;
use uuid::Uuid;

use crate::{
    communication::{
        prepare_bundle, CodebaseRegistry, CommunicationError, ManagementClient,
        TaskServerConnection,
    },
    job::{DispatchError, DispatchUnit},
    BundleId, UnitId,
};

use super::{complete_unit, reconnect, resubmit_unit, Channel, ChannelCore, ConnectionStatus};

/// A remote channel doing one blocking round trip per unit: send the bundle, then
/// read results until every sent task has one.
pub struct RemoteSyncChannel {
    core: ChannelCore,
    connection: Arc<dyn TaskServerConnection>,
    codebases: Arc<CodebaseRegistry>,
    management: Option<Arc<dyn ManagementClient>>,
    runtime: Handle,
    running: Mutex<HashSet<UnitId>>,
    next_bundle_id: AtomicU64,
}

impl RemoteSyncChannel {
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
            running: Mutex::new(HashSet::new()),
            next_bundle_id: AtomicU64::new(1),
        }
    }

    async fn execute(&self, unit: Arc<DispatchUnit>) {
        if unit.is_cancelled() {
            complete_unit(&self.core, &unit, None);
            return;
        }
        self.running.lock().unwrap().insert(unit.id());
        let job_uuid = unit.job_uuid();
        for codebase in unit.codebases() {
            self.codebases.register(&codebase, job_uuid);
        }

        match self.round_trip(&unit).await {
            Ok(()) => complete_unit(&self.core, &unit, None),
            Err(e) if self.core.is_shutting_down() => {
                tracing::debug!(
                    "[RemoteSync {}] channel closing, dropping unit {} ({})",
                    self.core.id(),
                    unit.id(),
                    e
                );
                unit.job().unit_abandoned(&unit);
                self.core.unit_finished();
            }
            Err(e) if e.is_terminal() => {
                tracing::warn!(
                    "[RemoteSync {}] unit {} failed: {}",
                    self.core.id(),
                    unit.id(),
                    e
                );
                let error = DispatchError::from(e);
                unit.results_received_error(&error);
                complete_unit(&self.core, &unit, Some(&error));
            }
            Err(e) => {
                tracing::warn!(
                    "[RemoteSync {}] round trip of unit {} broken: {}",
                    self.core.id(),
                    unit.id(),
                    e
                );
                self.core.set_status(ConnectionStatus::Disconnected);
                resubmit_unit(&self.core, &unit);
                reconnect(&self.core, self.connection.as_ref()).await;
            }
        }

        self.codebases.unregister(job_uuid);
        self.running.lock().unwrap().remove(&unit.id());
    }

    async fn round_trip(&self, unit: &DispatchUnit) -> Result<(), CommunicationError> {
        let bundle_id: BundleId = self.next_bundle_id.fetch_add(1, Ordering::SeqCst);
        let (bundle, rejected) = prepare_bundle(bundle_id, unit);
        unit.results_received(rejected);
        let expected = bundle.tasks.len();
        if expected == 0 {
            return Ok(());
        }
        tracing::debug!(
            "[RemoteSync {}] sending bundle {} of job {} with positions {:?}",
            self.core.id(),
            bundle_id,
            unit.job_uuid(),
            bundle.header.positions
        );
        let started = Instant::now();
        self.connection.send_bundle(bundle).await?;
        let mut received = 0;
        while received < expected {
            let batch = self.connection.receive_results().await?;
            if batch.bundle_id != bundle_id {
                tracing::debug!(
                    "[RemoteSync {}] ignoring results of bundle {}",
                    self.core.id(),
                    batch.bundle_id
                );
                continue;
            }
            received += batch.results.len();
            unit.results_received(batch.results);
        }
        self.core.record_round_trip(expected, started.elapsed());
        Ok(())
    }
}

impl Channel for RemoteSyncChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn start(self: Arc<Self>) {
        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            reconnect(&self.core, self.connection.as_ref()).await;
        });
    }

    fn submit(self: Arc<Self>, unit: Arc<DispatchUnit>) {
        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            self.execute(unit).await;
        });
    }

    /// The round trip is not interrupted: results that come back for a cancelled unit
    /// are kept, and the remaining tasks complete empty.
    fn cancel(&self, unit: &DispatchUnit) -> bool {
        unit.cancel();
        self.running.lock().unwrap().contains(&unit.id())
    }

    fn is_local(&self) -> bool {
        false
    }

    fn is_asynchronous(&self) -> bool {
        false
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
            self.connection.close().await;
            reconnect(&self.core, self.connection.as_ref()).await;
            self.core.set_resetting(false);
        });
    }

    fn close(&self) {
        self.core.set_closing();
        self.core.set_status(ConnectionStatus::Closed);
        let connection = Arc::clone(&self.connection);
        self.runtime.spawn(async move {
            connection.close().await;
        });
    }
}
