use std::sync::Arc;

use super::{
    listener::JobListener,
    sla::{ClientSla, JobSla},
    task::{DataProvider, Task},
};

/// Describes a job before it is handed to the [`DispatchManager`](crate::DispatchManager).
///
/// Tasks get their position in insertion order, starting at 0. Dependencies refer to
/// those positions.
pub struct JobSubmission {
    pub(crate) name: String,
    pub(crate) tasks: Vec<Task>,
    pub(crate) dependencies: Vec<(usize, usize)>,
    pub(crate) sla: JobSla,
    pub(crate) client_sla: ClientSla,
    pub(crate) data_provider: Option<DataProvider>,
    pub(crate) listeners: Vec<Arc<dyn JobListener>>,
}

impl JobSubmission {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tasks: Vec::new(),
            dependencies: Vec::new(),
            sla: JobSla::new(),
            client_sla: ClientSla::new(),
            data_provider: None,
            listeners: Vec::new(),
        }
    }

    /// Adds a task and returns its position.
    pub fn add_task(&mut self, mut task: Task) -> usize {
        let position = self.tasks.len();
        task.set_position(position);
        self.tasks.push(task);
        position
    }

    /// Declares that the task at `successor` depends on the task at `predecessor`.
    pub fn add_dependency(&mut self, predecessor: usize, successor: usize) {
        self.dependencies.push((predecessor, successor));
    }

    pub fn with_sla(mut self, sla: JobSla) -> Self {
        self.sla = sla;
        self
    }

    pub fn with_client_sla(mut self, client_sla: ClientSla) -> Self {
        self.client_sla = client_sla;
        self
    }

    pub fn with_data_provider(mut self, data_provider: DataProvider) -> Self {
        self.data_provider = Some(data_provider);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}
