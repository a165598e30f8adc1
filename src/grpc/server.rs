use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::agent_service::{AgentServiceImpl, SnapshotBook};
use crate::grpc::master_service::MasterServiceImpl;
use crate::proto::agent_service_server::AgentServiceServer;
use crate::proto::master_service_server::MasterServiceServer;
use crate::scheduler::{MemoryJobStore, Scheduler};

/// Hosts the job API and the agent endpoint on one address.
pub struct MasterServer {
    store: Arc<MemoryJobStore>,
    scheduler: Arc<Scheduler>,
    snapshots: SnapshotBook,
}

impl MasterServer {
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

    pub async fn run(
        self,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %addr, "Starting gRPC server");
        self.router()
            .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
            .await
    }

    /// Serve on an already bound listener.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Starting gRPC server");
        }
        self.router()
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await
    }

    fn router(self) -> tonic::transport::server::Router {
        let master = MasterServiceImpl::new(self.store, self.scheduler, self.snapshots.clone());
        let agent = AgentServiceImpl::new(self.snapshots);

        Server::builder()
            .add_service(MasterServiceServer::new(master))
            .add_service(AgentServiceServer::new(agent))
    }
}
