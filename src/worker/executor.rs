use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{PilotError, Result};
use crate::proto::executor_service_server::{ExecutorService, ExecutorServiceServer};
use crate::proto::{StartRequest, StartResponse, TerminateRequest, TerminateResponse};
use crate::scenario::CompiledPlan;
use crate::worker::reporter::SnapshotReporter;
use crate::worker::runner::VirtualUserRunner;
use crate::worker::runtime::WorkerRuntime;
use crate::worker::workload;

/// How long a terminated executor waits for queued snapshots to reach the agent.
const REPORTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Launch parameters passed by the supervisor on the command line.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub agent_addr: SocketAddr,
    pub executor_addr: SocketAddr,
    pub artifact_path: PathBuf,
    pub job_id: Uuid,
    pub runtime: RuntimeConfig,
}

/// Control endpoint of an executor subprocess.
pub struct ExecutorControl {
    runner: Arc<VirtualUserRunner>,
    /// Observed by virtual users.
    run_cancel: CancellationToken,
    /// Stops the control server.
    shutdown: CancellationToken,
    completion: RunCompletion,
}

/// Tracks the single run a `Start` call kicks off, independently of the
/// call itself.
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    started: Arc<AtomicBool>,
    done: CancellationToken,
}

impl RunCompletion {
    fn begin(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Resolves once the run has returned, immediately if it never started.
    pub async fn wait(&self) {
        if self.is_started() {
            self.done.cancelled().await;
        }
    }
}

impl ExecutorControl {
    pub fn new(runner: Arc<VirtualUserRunner>, shutdown: CancellationToken) -> Self {
        Self {
            runner,
            run_cancel: shutdown.child_token(),
            shutdown,
            completion: RunCompletion::default(),
        }
    }

    pub fn completion(&self) -> RunCompletion {
        self.completion.clone()
    }
}

#[tonic::async_trait]
impl ExecutorService for ExecutorControl {
    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> std::result::Result<Response<StartResponse>, Status> {
        if !request.into_inner().run {
            return Ok(Response::new(StartResponse { accepted: false }));
        }
        if !self.completion.begin() {
            tracing::warn!("Start requested twice, ignoring");
            return Ok(Response::new(StartResponse { accepted: false }));
        }

        tracing::info!("Executor starting the scenario");
        // The run lives in its own task: a caller hanging up on this call
        // must not abort virtual users. They stop through `run_cancel`.
        let (result_tx, result_rx) = oneshot::channel();
        let runner = self.runner.clone();
        let cancel = self.run_cancel.clone();
        let done = self.completion.done.clone();
        tokio::spawn(async move {
            let _done = done.drop_guard();
            let result = runner.run(cancel).await;
            drop(runner);
            let _ = result_tx.send(result);
        });

        let summary = result_rx
            .await
            .map_err(|_| Status::internal("scenario run panicked"))?
            .map_err(|e| Status::internal(e.to_string()))?;
        tracing::info!(
            virtual_users = summary.virtual_users,
            failed = summary.failed,
            "Scenario finished"
        );

        Ok(Response::new(StartResponse { accepted: true }))
    }

    async fn terminate(
        &self,
        request: Request<TerminateRequest>,
    ) -> std::result::Result<Response<TerminateResponse>, Status> {
        let code = request.into_inner().code;
        tracing::info!(code, "Executor terminating");
        self.run_cancel.cancel();
        self.shutdown.cancel();
        Ok(Response::new(TerminateResponse { accepted: true }))
    }
}

/// Entry point of the executor subprocess: load the artifact, expose the
/// control endpoint and serve it until terminated.
pub async fn run_executor(options: ExecutorOptions, shutdown: CancellationToken) -> Result<()> {
    let plan = CompiledPlan::load(&options.artifact_path)?;
    tracing::info!(
        job_id = %options.job_id,
        plan = %plan.name,
        groups = plan.groups.len(),
        "Artifact loaded"
    );

    let (snapshot_tx, snapshot_rx) = mpsc::channel(16);
    let reporter = SnapshotReporter::new(options.job_id, options.agent_addr)?;
    let reporter_handle = tokio::spawn(reporter.run(snapshot_rx));

    let groups = workload::build_groups(&plan)?;
    let runner = VirtualUserRunner::new(
        WorkerRuntime::new(),
        groups,
        options.runtime.snapshot_interval(),
    )
    .with_snapshot_sink(snapshot_tx);
    runner.setup()?;

    let control = ExecutorControl::new(Arc::new(runner), shutdown.clone());
    let completion = control.completion();

    tracing::info!(addr = %options.executor_addr, "Executor control endpoint listening");
    let stop = shutdown.clone();
    Server::builder()
        .add_service(ExecutorServiceServer::new(control))
        .serve_with_shutdown(options.executor_addr, async move { stop.cancelled().await })
        .await
        .map_err(PilotError::from)?;

    // Virtual users see the cancel and wind down; the final snapshot is
    // published before the run returns.
    completion.wait().await;

    // The runner owned the last snapshot sender, so the reporter ends once
    // everything queued has been sent.
    if tokio::time::timeout(REPORTER_DRAIN_TIMEOUT, reporter_handle)
        .await
        .is_err()
    {
        tracing::warn!(job_id = %options.job_id, "Timed out flushing snapshots to agent");
    }

    tracing::info!(job_id = %options.job_id, "Executor stopped");
    Ok(())
}
