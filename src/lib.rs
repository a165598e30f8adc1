pub mod config;
pub mod error;
pub mod grpc;
pub mod node;
pub mod scenario;
pub mod scheduler;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("loadpilot");
}
