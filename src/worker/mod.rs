//! Executor-side execution engine.
//!
//! Everything here runs inside an executor subprocess:
//! - **Metrics**: [`MetricsRegistry`] holds one unit per declared metric title
//! - **Runtime**: [`WorkerRuntime`] owns the registry and the idle/running status
//! - **Runner**: [`VirtualUserRunner`] launches every virtual user and reports snapshots
//! - **Control**: [`executor::ExecutorControl`] answers the supervisor's Start and Terminate calls
//!
//! # Execution Flow
//!
//! 1. The supervisor spawns `loadpilot executor ...` with a compiled plan
//! 2. [`executor::run_executor`] registers metrics and serves the control endpoint
//! 3. `Start` runs all virtual users to completion and emits a final snapshot
//! 4. `Terminate` cancels anything still running and stops the process

pub mod executor;
pub mod metrics;
pub mod reporter;
pub mod runner;
pub mod runtime;
pub mod workload;

pub use executor::{run_executor, ExecutorOptions};
pub use metrics::{MetricUnit, MetricsRegistry, SnapshotValue, UnitSnapshot};
pub use runner::{RunSummary, VirtualUserGroup, VirtualUserRunner, VuContext};
pub use runtime::{RuntimeSnapshot, WorkerRuntime, WorkerStatus};
