use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::api::{JobDescriptor, JobId};

/// Errors of [`JobRegistry`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No descriptor under this id.
    #[error("job {0} not found")]
    NotFound(JobId),
    /// A descriptor with this id already exists.
    #[error("job {0} already exists")]
    AlreadyExists(JobId),
}

/// Process-wide store of job descriptors.
///
/// Implementations must make every `mutate` atomic with respect to `get`:
/// readers never observe a partially applied mutation.
pub trait JobRegistry: Send + Sync {
    /// Register a new descriptor.
    fn create(&self, descriptor: JobDescriptor) -> Result<(), RegistryError>;

    /// Snapshot of the descriptor.
    fn get(&self, job_id: &JobId) -> Option<JobDescriptor>;

    /// Apply `f` to the descriptor in place.
    fn mutate(
        &self,
        job_id: &JobId,
        f: &mut dyn FnMut(&mut JobDescriptor),
    ) -> Result<(), RegistryError>;

    /// Remove the descriptor, returning it.
    fn delete(&self, job_id: &JobId) -> Option<JobDescriptor>;

    /// Identifiers of every registered job.
    fn job_ids(&self) -> Vec<JobId>;

    /// Set the abort flag. The flag is monotonic; repeated calls are no-ops.
    fn request_abort(&self, job_id: &JobId) -> Result<(), RegistryError> {
        self.mutate(job_id, &mut |descriptor| {
            descriptor.abort_requested = true;
        })
    }
}

/// [`JobRegistry`] held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryJobRegistry {
    jobs: DashMap<JobId, JobDescriptor>,
}

impl InMemoryJobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRegistry for InMemoryJobRegistry {
    fn create(&self, descriptor: JobDescriptor) -> Result<(), RegistryError> {
        match self.jobs.entry(descriptor.job_id.clone()) {
            Entry::Occupied(entry) => Err(RegistryError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(descriptor);
                Ok(())
            }
        }
    }

    fn get(&self, job_id: &JobId) -> Option<JobDescriptor> {
        self.jobs.get(job_id).map(|entry| entry.value().clone())
    }

    fn mutate(
        &self,
        job_id: &JobId,
        f: &mut dyn FnMut(&mut JobDescriptor),
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.clone()))?;
        let abort_requested = entry.abort_requested;
        f(entry.value_mut());
        entry.abort_requested |= abort_requested;
        entry.updated_at = chrono::Utc::now();
        Ok(())
    }

    fn delete(&self, job_id: &JobId) -> Option<JobDescriptor> {
        self.jobs.remove(job_id).map(|(_, descriptor)| descriptor)
    }

    fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{JobStatus, SearchRequest};

    fn descriptor(id: &str) -> JobDescriptor {
        let request = SearchRequest {
            query: "1ABC:A".to_string(),
            query_name: "1ABC".to_string(),
            qscore_threshold: 0.7,
            num_results: 5,
            disable_visualizations: true,
            disable_search_stats: false,
        };
        JobDescriptor::new(JobId::from(id), &request)
    }

    #[test]
    fn create_rejects_duplicates() {
        let registry = InMemoryJobRegistry::new();
        registry.create(descriptor("a")).unwrap();
        assert_eq!(
            registry.create(descriptor("a")),
            Err(RegistryError::AlreadyExists(JobId::from("a")))
        );
        assert_eq!(registry.job_ids(), vec![JobId::from("a")]);
    }

    #[test]
    fn mutate_unknown_job_is_not_found() {
        let registry = InMemoryJobRegistry::new();
        let err = registry
            .mutate(&JobId::from("missing"), &mut |d| d.status = JobStatus::Finished)
            .unwrap_err();
        assert_eq!(err, RegistryError::NotFound(JobId::from("missing")));
        assert!(registry.request_abort(&JobId::from("missing")).is_err());
    }

    #[test]
    fn abort_flag_is_monotonic() {
        let registry = InMemoryJobRegistry::new();
        let id = JobId::from("job");
        registry.create(descriptor("job")).unwrap();

        registry.request_abort(&id).unwrap();
        registry.request_abort(&id).unwrap();
        registry
            .mutate(&id, &mut |d| d.abort_requested = false)
            .unwrap();

        assert!(registry.get(&id).unwrap().abort_requested);
    }

    #[test]
    fn delete_returns_descriptor() {
        let registry = InMemoryJobRegistry::new();
        registry.create(descriptor("job")).unwrap();
        let removed = registry.delete(&JobId::from("job")).unwrap();
        assert_eq!(removed.query, "1ABC:A");
        assert!(registry.get(&JobId::from("job")).is_none());
    }

    #[test]
    fn concurrent_mutations_are_not_lost() {
        let registry = std::sync::Arc::new(InMemoryJobRegistry::new());
        let id = JobId::from("job");
        registry.create(descriptor("job")).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry
                            .mutate(&id, &mut |d| d.candidate_ids.push("x".to_string()))
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(registry.get(&id).unwrap().candidate_ids.len(), 800);
    }
}
