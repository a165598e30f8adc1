use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MasterConfig;
use crate::error::{PilotError, Result};
use crate::scenario::Compiler;
use crate::scheduler::job::{Job, JobState};
use crate::scheduler::store::JobStore;
use crate::supervisor::ExecutorSupervisor;

#[derive(Debug)]
struct ActiveJob {
    id: Uuid,
    cancel: CancellationToken,
}

/// Polls the store and drives one job at a time through
/// provisioning, compilation, execution and a single terminal write.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    compiler: Compiler,
    supervisor: ExecutorSupervisor,
    poll_interval: Duration,
    /// Shared by `cancel` and the finalizer so they agree on the active job.
    active: Mutex<Option<ActiveJob>>,
}

impl Scheduler {
    pub fn new(config: &MasterConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            compiler: Compiler::new(config.compiler.clone()),
            supervisor: ExecutorSupervisor::new(config.executor.clone(), config.agent_addr()),
            poll_interval: config.poll_interval(),
            active: Mutex::new(None),
        }
    }

    pub async fn poll_next(&self) -> Result<Option<Job>> {
        self.store.next_pending().await
    }

    pub fn active_job(&self) -> Option<Uuid> {
        self.active.lock().as_ref().map(|a| a.id)
    }

    /// Signal cancellation to the active job. The running stage observes it
    /// and the finalizer records the job as canceled.
    pub fn cancel(&self, job_id: &Uuid) -> Result<()> {
        let active = self.active.lock();
        match active.as_ref() {
            Some(a) if a.id == *job_id => {
                tracing::info!(job_id = %job_id, "Cancel requested");
                a.cancel.cancel();
                Ok(())
            }
            _ => Err(PilotError::AppNotRunning(*job_id)),
        }
    }

    /// Run `job` to completion and write its terminal state.
    ///
    /// Returns `Ok` when the job finished, [`PilotError::AppIsCanceled`] when
    /// it stopped because of a cancel, and the stage error otherwise.
    pub async fn execute(&self, job: Job) -> Result<()> {
        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock();
            if let Some(current) = active.as_ref() {
                return Err(PilotError::Internal(format!(
                    "job {} is already active",
                    current.id
                )));
            }
            *active = Some(ActiveJob {
                id: job.id,
                cancel: cancel.clone(),
            });
        }

        tracing::info!(job_id = %job.id, name = %job.name, "Job picked up");
        let outcome = self.run_job(&job, &cancel).await;
        self.finalize(&job, &cancel, outcome).await
    }

    async fn run_job(&self, job: &Job, cancel: &CancellationToken) -> Result<()> {
        self.transition(job, JobState::Provisioning).await?;

        let artifact = self.compiler.compile(&job.scenario, cancel).await?;
        tracing::info!(job_id = %job.id, artifact = %artifact.path().display(), "Scenario compiled");
        if cancel.is_cancelled() {
            return Err(PilotError::Canceled);
        }

        self.transition(job, JobState::Running).await?;
        self.supervisor.execute(&job.id, artifact, cancel).await
    }

    async fn transition(&self, job: &Job, state: JobState) -> Result<()> {
        self.store.update_state(&job.id, state, None).await?;
        tracing::info!(job_id = %job.id, state = %state, "Job state updated");
        Ok(())
    }

    /// The only place a terminal state is written.
    async fn finalize(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        outcome: Result<()>,
    ) -> Result<()> {
        self.active.lock().take();

        let (state, result) = match outcome {
            Ok(()) => (JobState::Finished, Ok(())),
            Err(e) if cancel.is_cancelled() => {
                tracing::info!(job_id = %job.id, error = %e, "Job canceled");
                (JobState::Cancel, Err(PilotError::AppIsCanceled(job.id)))
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Job failed");
                (JobState::Error, Err(e))
            }
        };

        let message = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self.store.update_state(&job.id, state, message).await {
            tracing::error!(
                job_id = %job.id,
                state = %state,
                error = %e,
                "Failed to record terminal state"
            );
            return Err(e);
        }

        tracing::info!(job_id = %job.id, state = %state, "Job completed");
        result
    }

    /// Poll loop. Runs until `shutdown` fires; an active job is canceled and
    /// finalized before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(poll_interval = ?self.poll_interval, "Scheduler started");

        while !shutdown.is_cancelled() {
            match self.poll_next().await {
                Ok(Some(job)) => {
                    let job_id = job.id;
                    let execution = self.execute(job);
                    tokio::pin!(execution);

                    let result = tokio::select! {
                        biased;
                        result = &mut execution => result,
                        _ = shutdown.cancelled() => {
                            tracing::info!(job_id = %job_id, "Shutting down, canceling active job");
                            let _ = self.cancel(&job_id);
                            execution.await
                        }
                    };
                    match result {
                        Ok(()) => continue,
                        // Back off in case the store keeps failing.
                        Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Job did not finish"),
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Failed to poll for pending jobs"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("Scheduler stopped");
    }
}
