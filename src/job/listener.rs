use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ChannelId;

use super::task::TaskResult;

/// Status of a job as reported to its submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmissionStatus {
    Submitted,
    Pending,
    Executing,
    Complete,
    Failed,
    Cancelled,
}

impl SubmissionStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Complete | SubmissionStatus::Failed | SubmissionStatus::Cancelled
        )
    }
}

/// Notification sent to the [`JobListener`]s of a job.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_uuid: Uuid,
    pub job_name: String,
    /// The channel involved, if any.
    pub channel: Option<ChannelId>,
    /// The positions of the tasks involved.
    pub positions: Vec<usize>,
    /// The results which just arrived, for [`JobListener::job_returned`].
    pub results: Vec<TaskResult>,
}

/// Receives the lifecycle events of a job. Callbacks run on the thread that caused
/// the event and must not block.
pub trait JobListener: Send + Sync {
    /// A unit of the job was handed to a channel.
    fn job_dispatched(&self, _event: &JobEvent) {}
    /// Results of the job arrived.
    fn job_returned(&self, _event: &JobEvent) {}
    /// The job is done.
    fn job_ended(&self, _event: &JobEvent) {}
}
