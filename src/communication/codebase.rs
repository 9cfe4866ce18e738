use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};

use uuid::Uuid;

use crate::job::Codebase;

/// Tracks the code bases the servers may request while executing a job's tasks.
///
/// Remote channels register every distinct code base of a unit before dispatching it,
/// and unregister the job's code bases once the round trip is over.
#[derive(Debug, Default)]
pub struct CodebaseRegistry {
    registrations: Mutex<HashMap<Uuid, BTreeSet<Codebase>>>,
    total: Mutex<usize>,
}

impl CodebaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `codebase` for the job `job_uuid`. Returns `false` if it already was.
    pub fn register(&self, codebase: &Codebase, job_uuid: Uuid) -> bool {
        let added = self
            .registrations
            .lock()
            .unwrap()
            .entry(job_uuid)
            .or_default()
            .insert(codebase.clone());
        *self.total.lock().unwrap() += 1;
        if added {
            tracing::trace!("Registered code base {} for job {}", codebase, job_uuid);
        }
        added
    }

    /// Drops every code base registered for the job `job_uuid`.
    pub fn unregister(&self, job_uuid: Uuid) {
        self.registrations.lock().unwrap().remove(&job_uuid);
    }

    /// The code bases currently registered for the job `job_uuid`.
    pub fn registered(&self, job_uuid: Uuid) -> Vec<Codebase> {
        self.registrations
            .lock()
            .unwrap()
            .get(&job_uuid)
            .map(|codebases| codebases.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of registration requests received so far.
    pub fn registration_count(&self) -> usize {
        *self.total.lock().unwrap()
    }
}
