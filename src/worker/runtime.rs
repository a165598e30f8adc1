use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{PilotError, Result};
use crate::worker::metrics::{MetricsRegistry, UnitSnapshot};
use crate::worker::runner::VirtualUserGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Running,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Running => write!(f, "running"),
        }
    }
}

/// Point-in-time view of every metric unit in a runtime.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub hostname: String,
    pub pid: u32,
    pub timestamp_ms: i64,
    pub is_final: bool,
    pub units: Vec<UnitSnapshot>,
}

impl RuntimeSnapshot {
    pub fn unit(&self, title: &str) -> Option<&UnitSnapshot> {
        self.units.iter().find(|u| u.title == title)
    }
}

#[derive(Debug)]
struct RuntimeState {
    status: WorkerStatus,
    registry: MetricsRegistry,
}

/// Per-process worker state shared by the runner and every virtual user.
///
/// Cloning yields another handle to the same state. All reads and writes go
/// through one mutex, which also orders updates to a single unit.
#[derive(Debug, Clone)]
pub struct WorkerRuntime {
    hostname: Arc<str>,
    pid: u32,
    state: Arc<Mutex<RuntimeState>>,
}

impl Default for WorkerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRuntime {
    pub fn new() -> Self {
        Self::with_identity(local_hostname(), std::process::id())
    }

    pub fn with_identity(hostname: impl Into<String>, pid: u32) -> Self {
        let hostname: String = hostname.into();
        Self {
            hostname: Arc::from(hostname),
            pid,
            state: Arc::new(Mutex::new(RuntimeState {
                status: WorkerStatus::Idle,
                registry: MetricsRegistry::new(),
            })),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().status
    }

    /// Register every metric declared by `groups`. Titles already present are
    /// skipped; the first registration wins.
    pub fn setup(&self, groups: &[VirtualUserGroup]) -> Result<()> {
        let mut state = self.state.lock();
        for group in groups {
            for graph in &group.graphs {
                for metric in &graph.metrics {
                    let added = state.registry.register(&metric.title, metric.kind)?;
                    if !added {
                        tracing::debug!(
                            title = %metric.title,
                            group = %group.name,
                            "Metric already registered, skipping"
                        );
                    }
                }
            }
        }
        tracing::info!(units = state.registry.len(), "Metrics registered");
        Ok(())
    }

    pub fn notify(&self, title: &str, value: i64) -> Result<()> {
        tracing::trace!(title, value, "Notify");
        self.state.lock().registry.notify(title, value)
    }

    pub fn snapshot(&self, is_final: bool) -> RuntimeSnapshot {
        let units = self.state.lock().registry.snapshot();
        RuntimeSnapshot {
            hostname: self.hostname.to_string(),
            pid: self.pid,
            timestamp_ms: Utc::now().timestamp_millis(),
            is_final,
            units,
        }
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub(crate) fn mark_running(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status == WorkerStatus::Running {
            return Err(PilotError::Internal("worker is already running".to_string()));
        }
        state.status = WorkerStatus::Running;
        Ok(())
    }

    /// Back to idle with an empty registry.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.status = WorkerStatus::Idle;
        state.registry.clear();
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".into())
}
