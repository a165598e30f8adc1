pub mod job;
pub mod master;
pub mod store;

pub use job::{Job, JobState};
pub use master::Scheduler;
pub use store::{JobStore, MemoryJobStore};
