pub mod agent_service;
pub mod master_service;
pub mod server;

pub use agent_service::{AgentServiceImpl, SnapshotBook};
pub use master_service::MasterServiceImpl;
pub use server::MasterServer;
