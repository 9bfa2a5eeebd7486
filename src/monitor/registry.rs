use std::collections::HashMap;

use uuid::Uuid;

use crate::monitor::JobHandle;
use crate::transport::Connector;

const DEFAULT_MAX_JOBS: usize = 1_000;

/// In-memory index of the jobs a monitor is tracking.
pub struct JobRegistry<C: Connector> {
    jobs: HashMap<Uuid, JobHandle<C>>,
    max_jobs: usize,
}

impl<C: Connector> Default for JobRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> JobRegistry<C> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            max_jobs,
        }
    }

    /// Track a job. Returns false if the registry is at capacity.
    pub fn add(&mut self, handle: JobHandle<C>) -> bool {
        if self.jobs.len() >= self.max_jobs {
            return false;
        }
        self.jobs.insert(handle.id(), handle);
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<&JobHandle<C>> {
        self.jobs.get(id)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<JobHandle<C>> {
        self.jobs.remove(id)
    }

    pub fn handles(&self) -> Vec<JobHandle<C>> {
        self.jobs.values().cloned().collect()
    }

    pub fn capacity(&self) -> usize {
        self.max_jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
