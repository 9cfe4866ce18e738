use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    job::{DataProvider, DispatchUnit, JobSla, Task, TaskError, TaskResult},
    BundleId,
};

use super::CommunicationError;

/// Describes a bundle sent to a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleHeader {
    pub bundle_id: BundleId,
    pub job_uuid: Uuid,
    pub job_name: String,
    pub sla: JobSla,
    /// Positions of the tasks in the bundle, in the job's numbering.
    pub positions: Vec<usize>,
    /// Dependencies the server has to honour between the tasks of the bundle.
    pub dependencies: Vec<(usize, usize)>,
}

/// A bundle ready to be sent: only the tasks that can be shipped.
pub struct OutboundBundle {
    pub header: BundleHeader,
    pub tasks: Vec<Task>,
    pub data_provider: Option<Arc<DataProvider>>,
}

/// A batch of results returned by a server for one bundle. A bundle's results may be
/// split over several batches.
#[derive(Debug, Clone)]
pub struct ResultBatch {
    pub bundle_id: BundleId,
    pub results: Vec<TaskResult>,
}

/// Splits the tasks of `unit` into the bundle to send and the results of the tasks
/// which cannot be serialized. The latter are resolved locally without a round trip.
pub fn prepare_bundle(
    bundle_id: BundleId,
    unit: &DispatchUnit,
) -> (OutboundBundle, Vec<TaskResult>) {
    let (sendable, rejected): (Vec<Task>, Vec<Task>) = unit
        .tasks()
        .iter()
        .cloned()
        .partition(|task| task.is_serializable());
    let rejected = rejected
        .into_iter()
        .map(|task| {
            TaskResult::exception(
                task.position(),
                TaskError::NotSerializable(format!(
                    "task {} of job '{}' cannot be serialized",
                    task.position(),
                    unit.job_name()
                )),
            )
        })
        .collect();
    let positions: Vec<usize> = sendable.iter().map(|task| task.position()).collect();
    let dependencies = unit
        .graph()
        .map(|graph| {
            graph
                .edges()
                .into_iter()
                .filter(|(from, to)| positions.contains(from) && positions.contains(to))
                .collect()
        })
        .unwrap_or_default();
    let header = BundleHeader {
        bundle_id,
        job_uuid: unit.job_uuid(),
        job_name: unit.job_name().to_string(),
        sla: unit.sla().clone(),
        positions,
        dependencies,
    };
    (
        OutboundBundle {
            header,
            tasks: sendable,
            data_provider: unit.data_provider(),
        },
        rejected,
    )
}

/// A connection to a compute server driven by a remote channel.
///
/// A synchronous channel sends one bundle and then receives until it has every result.
/// An asynchronous channel sends and receives from two independent loops, so
/// `send_bundle` and `receive_results` may run concurrently.
#[async_trait]
pub trait TaskServerConnection: Send + Sync {
    /// The uuid of the driver behind this connection.
    fn driver_uuid(&self) -> Uuid;

    /// A human-readable name, also part of the channel identity.
    fn name(&self) -> String;

    /// Establishes, or re-establishes, the connection.
    async fn connect(&self) -> Result<(), CommunicationError>;

    async fn send_bundle(&self, bundle: OutboundBundle) -> Result<(), CommunicationError>;

    /// Waits for the next batch of results.
    async fn receive_results(&self) -> Result<ResultBatch, CommunicationError>;

    async fn close(&self);
}
