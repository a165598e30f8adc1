//! Executor supervision on the master side.
//!
//! A job's compiled artifact runs in its own `loadpilot executor` process.
//! The supervisor spawns it, waits for its control endpoint to come up,
//! issues `Start` and then `Terminate`, and collects its exit status while
//! re-logging its output.

pub mod output;
pub mod readiness;

use std::net::{SocketAddr, TcpListener};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::{PilotError, Result};
use crate::proto::executor_service_client::ExecutorServiceClient;
use crate::proto::{StartRequest, TerminateRequest};
use crate::scenario::CompiledArtifact;

pub use readiness::wait_for_ready;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs compiled artifacts in isolated executor subprocesses.
#[derive(Debug, Clone)]
pub struct ExecutorSupervisor {
    config: ExecutorConfig,
    agent_addr: SocketAddr,
}

impl ExecutorSupervisor {
    pub fn new(config: ExecutorConfig, agent_addr: SocketAddr) -> Self {
        Self { config, agent_addr }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `artifact` for `job_id` and wait for the executor to exit.
    ///
    /// The artifact is consumed and removed once the executor is gone.
    pub async fn execute(
        &self,
        job_id: &Uuid,
        artifact: CompiledArtifact,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let executor_addr = reserve_loopback_addr()?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.leading_args)
            .arg("--agent-addr")
            .arg(self.agent_addr.to_string())
            .arg("--executor-addr")
            .arg(executor_addr.to_string())
            .arg("--artifact-path")
            .arg(artifact.path())
            .arg("--job-id")
            .arg(job_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(PilotError::ExecutorSpawn)?;

        tracing::info!(
            job_id = %job_id,
            pid = ?child.id(),
            executor_addr = %executor_addr,
            "Executor spawned"
        );

        let mut drains: Vec<JoinHandle<usize>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(tokio::spawn(output::drain(*job_id, "stdout", stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(tokio::spawn(output::drain(*job_id, "stderr", stderr)));
        }

        let mut client = match wait_for_ready(
            executor_addr,
            self.config.ready_timeout(),
            self.config.ready_poll_interval(),
            cancel,
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Executor readiness failed");
                kill(&mut child, job_id).await;
                finish_drains(drains).await;
                return Err(e);
            }
        };

        let started = start(&mut client, job_id, cancel).await;
        terminate(&mut client, job_id).await;
        // An open connection would hold up the executor's graceful shutdown.
        drop(client);
        let exited = self.wait_exit(&mut child, job_id).await;
        finish_drains(drains).await;
        drop(artifact);

        started?;
        let status = exited?;
        if !status.success() {
            return Err(PilotError::ExecutorExit(status.to_string()));
        }

        tracing::info!(job_id = %job_id, "Executor finished");
        Ok(())
    }

    async fn wait_exit(&self, child: &mut Child, job_id: &Uuid) -> Result<ExitStatus> {
        let grace = self.config.exit_grace();
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                tracing::warn!(job_id = %job_id, grace = ?grace, "Executor did not exit, killing it");
                kill(child, job_id).await;
                Err(PilotError::ExecutorExit(format!(
                    "still running {:?} after terminate",
                    grace
                )))
            }
        }
    }
}

async fn start(
    client: &mut ExecutorServiceClient<Channel>,
    job_id: &Uuid,
    cancel: &CancellationToken,
) -> Result<()> {
    tracing::info!(job_id = %job_id, "Starting executor");
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::info!(job_id = %job_id, "Canceled while executor was running");
            return Err(PilotError::Canceled);
        }
        response = client.start(StartRequest { run: true }) => response,
    };

    let response = response.map_err(|status| PilotError::Control {
        call: "start",
        status,
    })?;
    if !response.into_inner().accepted {
        return Err(PilotError::ExecutorRejected);
    }
    Ok(())
}

/// The executor may already be gone, so a failure here is only logged.
async fn terminate(client: &mut ExecutorServiceClient<Channel>, job_id: &Uuid) {
    match client.terminate(TerminateRequest { code: 0 }).await {
        Ok(_) => tracing::debug!(job_id = %job_id, "Executor acknowledged terminate"),
        Err(status) => {
            tracing::debug!(job_id = %job_id, error = %status, "Terminate call failed, ignoring")
        }
    }
}

async fn kill(child: &mut Child, job_id: &Uuid) {
    if let Err(e) = child.kill().await {
        tracing::debug!(job_id = %job_id, error = %e, "Failed to kill executor");
    }
}

async fn finish_drains(drains: Vec<JoinHandle<usize>>) {
    for drain in drains {
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::debug!("Executor output still open after exit");
        }
    }
}

/// Pick a free loopback port for the executor's control endpoint.
///
/// The listener is closed before the executor binds the port itself.
pub fn reserve_loopback_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?)
}
