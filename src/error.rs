use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobState;

/// Why an executor control endpoint never became usable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("cancel")]
    Canceled,
}

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("No running job with id {0}")]
    AppNotRunning(Uuid),

    #[error("Job {0} is canceled")]
    AppIsCanceled(Uuid),

    #[error("Metric id not found: {0}")]
    IdNotFound(String),

    #[error("Metric {title} rejected sample {value}")]
    InvalidSample { title: String, value: i64 },

    #[error("Failed compiling the scenario: {0}")]
    Compile(String),

    #[error("Invalid scenario: {0}")]
    Scenario(String),

    #[error("Executor readiness: {0}")]
    Readiness(#[from] ReadinessError),

    #[error("Executor control call {call} failed: {status}")]
    Control {
        call: &'static str,
        status: tonic::Status,
    },

    #[error("Executor start: {0}")]
    ExecutorSpawn(std::io::Error),

    #[error("Executor exited abnormally: {0}")]
    ExecutorExit(String),

    #[error("Executor rejected the start request")]
    ExecutorRejected,

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Job store is at capacity")]
    StoreFull,

    #[error("Operation canceled")]
    Canceled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PilotError>;
