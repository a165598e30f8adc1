use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::error::Result;
use crate::grpc::{MasterServer, SnapshotBook};
use crate::scheduler::{MemoryJobStore, Scheduler};

/// Master process: job store, scheduler loop and the gRPC endpoint that
/// serves both the job API and the executors' agent callbacks.
pub struct MasterNode {
    pub config: MasterConfig,
    pub store: Arc<MemoryJobStore>,
    pub scheduler: Arc<Scheduler>,
    pub snapshots: SnapshotBook,
}

impl MasterNode {
    pub fn new(config: MasterConfig) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let scheduler = Arc::new(Scheduler::new(&config, store.clone()));

        Self {
            config,
            store,
            scheduler,
            snapshots: SnapshotBook::new(),
        }
    }

    /// Bind the configured address and run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Run the scheduler loop and serve gRPC on `listener`.
    ///
    /// The listener must be bound to the address executors reach the agent
    /// on, i.e. [`MasterConfig::agent_addr`].
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let scheduler_stop = shutdown.child_token();
        let scheduler = self.scheduler.clone();
        let stop = scheduler_stop.clone();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run(stop).await;
        });

        let server = MasterServer::new(self.store, self.scheduler, self.snapshots);
        let served = server.run_with_listener(listener, shutdown).await;

        scheduler_stop.cancel();
        if let Err(e) = scheduler_handle.await {
            tracing::error!(error = %e, "Scheduler task failed");
        }

        served?;
        tracing::info!("Master stopped");
        Ok(())
    }
}
