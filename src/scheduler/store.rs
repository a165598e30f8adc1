use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PilotError, Result};
use crate::scheduler::job::{Job, JobState};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Persistence boundary consumed by the scheduler.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Oldest pending job by creation time, if any.
    async fn next_pending(&self) -> Result<Option<Job>>;

    /// Persist a new state (and the last error, if any) and bump `updated_at`.
    async fn update_state(&self, id: &Uuid, state: JobState, error: Option<String>)
        -> Result<Job>;
}

/// In-memory job store.
#[derive(Debug)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    max_jobs: usize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_jobs,
        }
    }

    /// Add a new job. Fails with [`PilotError::StoreFull`] at capacity.
    pub async fn submit(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.len() >= self.max_jobs {
            return Err(PilotError::StoreFull);
        }
        tracing::debug!(job_id = %job.id, name = %job.name, "Job stored");
        jobs.insert(job.id, job);
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    /// All jobs sorted chronologically by creation time.
    pub async fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    /// Remove jobs in a terminal state. Returns the number removed.
    pub async fn cleanup_finished(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !job.state.is_terminal());
        before - jobs.len()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn next_pending(&self) -> Result<Option<Job>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .min_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn update_state(
        &self,
        id: &Uuid,
        state: JobState,
        error: Option<String>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(PilotError::JobNotFound(*id))?;
        if !job.state.can_transition_to(state) {
            return Err(PilotError::InvalidTransition {
                job_id: *id,
                from: job.state,
                to: state,
            });
        }
        job.state = state;
        if error.is_some() {
            job.error = error;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }
}
