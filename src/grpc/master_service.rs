use std::sync::Arc;

use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::error::PilotError;
use crate::grpc::agent_service::SnapshotBook;
use crate::proto::master_service_server::MasterService;
use crate::proto::{
    CancelJobRequest, CancelJobResponse, GetJobStatusRequest, JobInfo,
    JobState as ProtoJobState, ListJobsRequest, ListJobsResponse, SubmitJobRequest,
    SubmitJobResponse,
};
use crate::scheduler::{Job, JobState, MemoryJobStore, Scheduler};

/// gRPC service for the job API used by the CLI.
pub struct MasterServiceImpl {
    store: Arc<MemoryJobStore>,
    scheduler: Arc<Scheduler>,
    snapshots: SnapshotBook,
}

impl MasterServiceImpl {
    pub fn new(
        store: Arc<MemoryJobStore>,
        scheduler: Arc<Scheduler>,
        snapshots: SnapshotBook,
    ) -> Self {
        Self {
            store,
            scheduler,
            snapshots,
        }
    }

    async fn job_info(&self, job: &Job) -> JobInfo {
        let metrics = self
            .snapshots
            .latest(&job.id)
            .await
            .map(|s| s.units)
            .unwrap_or_default();

        JobInfo {
            job_id: job.id.to_string(),
            name: job.name.clone(),
            state: state_to_proto(job.state) as i32,
            error: job.error.clone().unwrap_or_default(),
            created_at_ms: job.created_at.timestamp_millis(),
            updated_at_ms: job.updated_at.timestamp_millis(),
            metrics,
        }
    }
}

#[tonic::async_trait]
impl MasterService for MasterServiceImpl {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let req = request.into_inner();

        if req.scenario.trim().is_empty() {
            return Err(Status::invalid_argument("Scenario cannot be empty"));
        }

        let id = Uuid::new_v4();
        let name = if req.name.trim().is_empty() {
            format!("job-{}", &id.simple().to_string()[..8])
        } else {
            req.name
        };
        let job = Job::with_id(id, name, req.scenario, chrono::Utc::now());
        let created_at_ms = job.created_at.timestamp_millis();

        self.store.submit(job).await.map_err(error_to_status)?;

        tracing::info!(job_id = %id, created_at_ms, "Job submitted");
        Ok(Response::new(SubmitJobResponse {
            job_id: id.to_string(),
            created_at_ms,
        }))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        self.scheduler.cancel(&job_id).map_err(error_to_status)?;
        Ok(Response::new(CancelJobResponse { cancelled: true }))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<JobInfo>, Status> {
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        let job = self
            .store
            .get(&job_id)
            .await
            .ok_or_else(|| Status::not_found("Job not found"))?;
        Ok(Response::new(self.job_info(&job).await))
    }

    async fn list_jobs(
        &self,
        _request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let mut jobs = Vec::new();
        for job in self.store.all_jobs().await {
            jobs.push(self.job_info(&job).await);
        }
        Ok(Response::new(ListJobsResponse { jobs }))
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw).map_err(|_| Status::invalid_argument("Invalid job ID"))
}

pub fn error_to_status(error: PilotError) -> Status {
    match error {
        PilotError::AppNotRunning(_) | PilotError::InvalidTransition { .. } => {
            Status::failed_precondition(error.to_string())
        }
        PilotError::JobNotFound(_) => Status::not_found(error.to_string()),
        PilotError::Scenario(_) | PilotError::InvalidSample { .. } => {
            Status::invalid_argument(error.to_string())
        }
        PilotError::StoreFull => Status::resource_exhausted(error.to_string()),
        PilotError::AppIsCanceled(_) | PilotError::Canceled => Status::cancelled(error.to_string()),
        other => Status::internal(other.to_string()),
    }
}

pub fn state_to_proto(state: JobState) -> ProtoJobState {
    match state {
        JobState::Pending => ProtoJobState::Pending,
        JobState::Provisioning => ProtoJobState::Provisioning,
        JobState::Running => ProtoJobState::Running,
        JobState::Finished => ProtoJobState::Finished,
        JobState::Cancel => ProtoJobState::Cancel,
        JobState::Error => ProtoJobState::Error,
    }
}

/// Lowercase name used by the CLI; mirrors [`JobState`]'s `Display`.
pub fn proto_state_name(state: i32) -> &'static str {
    match ProtoJobState::try_from(state) {
        Ok(ProtoJobState::Pending) => "pending",
        Ok(ProtoJobState::Provisioning) => "provisioning",
        Ok(ProtoJobState::Running) => "running",
        Ok(ProtoJobState::Finished) => "finished",
        Ok(ProtoJobState::Cancel) => "cancel",
        Ok(ProtoJobState::Error) => "error",
        Ok(ProtoJobState::Unspecified) | Err(_) => "unknown",
    }
}
