use std::sync::Mutex;

use uuid::Uuid;

use super::CommunicationError;

/// Out-of-band administrative link to a driver, used to cancel jobs on the server side.
pub trait ManagementClient: Send + Sync {
    fn cancel_job(&self, job_uuid: Uuid) -> Result<(), CommunicationError>;
}

/// A [`ManagementClient`] which records the requests it receives.
#[derive(Debug, Default)]
pub struct RecordingManagementClient {
    cancelled: Mutex<Vec<Uuid>>,
}

impl RecordingManagementClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// The uuids of the jobs cancelled so far, in request order.
    pub fn cancelled_jobs(&self) -> Vec<Uuid> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl ManagementClient for RecordingManagementClient {
    fn cancel_job(&self, job_uuid: Uuid) -> Result<(), CommunicationError> {
        tracing::debug!("Management request to cancel job {}", job_uuid);
        self.cancelled.lock().unwrap().push(job_uuid);
        Ok(())
    }
}
