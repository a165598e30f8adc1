use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::error::{ReadinessError, Result};
use crate::proto::executor_service_client::ExecutorServiceClient;

/// Poll the executor control endpoint until a connection succeeds.
///
/// The subprocess binds its listener some time after spawn, so connection
/// attempts are repeated every `interval`. Fails with
/// [`ReadinessError::Timeout`] once `timeout` has elapsed and with
/// [`ReadinessError::Canceled`] as soon as `cancel` fires.
pub async fn wait_for_ready(
    addr: SocketAddr,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<ExecutorServiceClient<Channel>> {
    let endpoint = Endpoint::from_shared(format!("http://{}", addr))?.connect_timeout(timeout);
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReadinessError::Canceled.into()),
            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!(addr = %addr, attempts, "Executor never became ready");
                return Err(ReadinessError::Timeout(timeout).into());
            }
            result = endpoint.connect() => match result {
                Ok(channel) => {
                    tracing::debug!(addr = %addr, attempts, "Executor control endpoint ready");
                    return Ok(ExecutorServiceClient::new(channel));
                }
                Err(e) => tracing::trace!(addr = %addr, error = %e, "Executor not ready yet"),
            },
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReadinessError::Canceled.into()),
            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!(addr = %addr, attempts, "Executor never became ready");
                return Err(ReadinessError::Timeout(timeout).into());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
