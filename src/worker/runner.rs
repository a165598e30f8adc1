use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scenario::Graph;
use crate::worker::metrics::SnapshotValue;
use crate::worker::runtime::{RuntimeSnapshot, WorkerRuntime};

const MIN_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(1);

pub type WorkloadFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Body of a virtual user. Called once per instance.
pub type Workload = Arc<dyn Fn(VuContext) -> WorkloadFuture + Send + Sync>;

/// What a single virtual-user instance is handed when it starts.
#[derive(Debug, Clone)]
pub struct VuContext {
    pub group: usize,
    pub instance: usize,
    pub cancel: CancellationToken,
    pub runtime: WorkerRuntime,
}

#[derive(Clone)]
pub struct VirtualUserGroup {
    pub name: String,
    pub concurrency: usize,
    pub graphs: Vec<Graph>,
    pub workload: Workload,
}

impl std::fmt::Debug for VirtualUserGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualUserGroup")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("graphs", &self.graphs)
            .finish_non_exhaustive()
    }
}

impl VirtualUserGroup {
    pub fn new<F, Fut>(name: impl Into<String>, concurrency: usize, workload: F) -> Self
    where
        F: Fn(VuContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            concurrency,
            graphs: Vec::new(),
            workload: Arc::new(move |ctx| -> WorkloadFuture { Box::pin(workload(ctx)) }),
        }
    }

    pub fn with_graph(mut self, graph: Graph) -> Self {
        self.graphs.push(graph);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub virtual_users: usize,
    /// Instances that panicked.
    pub failed: usize,
    /// Registry contents just before the runtime was reset.
    pub final_snapshot: RuntimeSnapshot,
}

/// Runs every declared virtual user concurrently and reports metric snapshots
/// while they run.
pub struct VirtualUserRunner {
    runtime: WorkerRuntime,
    groups: Vec<VirtualUserGroup>,
    snapshot_interval: Duration,
    sink: Option<mpsc::Sender<RuntimeSnapshot>>,
}

impl VirtualUserRunner {
    pub fn new(
        runtime: WorkerRuntime,
        groups: Vec<VirtualUserGroup>,
        snapshot_interval: Duration,
    ) -> Self {
        Self {
            runtime,
            groups,
            // A zero period would make the ticker panic.
            snapshot_interval: snapshot_interval.max(MIN_SNAPSHOT_INTERVAL),
            sink: None,
        }
    }

    /// Also publish every periodic and the final snapshot on `sink`.
    pub fn with_snapshot_sink(mut self, sink: mpsc::Sender<RuntimeSnapshot>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn runtime(&self) -> &WorkerRuntime {
        &self.runtime
    }

    pub fn setup(&self) -> Result<()> {
        self.runtime.setup(&self.groups)
    }

    pub fn total_concurrency(&self) -> usize {
        self.groups.iter().map(|g| g.concurrency).sum()
    }

    /// Launch all instances and wait for every one of them to finish.
    ///
    /// Cancellation is cooperative: instances see `cancel` through their
    /// [`VuContext`] and are never aborted.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        self.runtime.mark_running()?;

        let total = self.total_concurrency();
        tracing::info!(
            groups = self.groups.len(),
            virtual_users = total,
            "Starting virtual users"
        );

        let snapshot_stop = cancel.child_token();
        let snapshot_task = tokio::spawn(snapshot_loop(
            self.runtime.clone(),
            self.snapshot_interval,
            self.sink.clone(),
            snapshot_stop.clone(),
        ));

        let mut instances = JoinSet::new();
        for (group_index, group) in self.groups.iter().enumerate() {
            for instance in 0..group.concurrency {
                let ctx = VuContext {
                    group: group_index,
                    instance,
                    cancel: cancel.clone(),
                    runtime: self.runtime.clone(),
                };
                instances.spawn((group.workload)(ctx));
            }
        }

        let mut completed = 0usize;
        let mut failed = 0usize;
        while let Some(result) = instances.join_next().await {
            completed += 1;
            if let Err(e) = result {
                failed += 1;
                tracing::warn!(error = %e, "Virtual user terminated abnormally");
            }
        }

        snapshot_stop.cancel();
        if let Err(e) = snapshot_task.await {
            tracing::warn!(error = %e, "Snapshot task failed");
        }

        let final_snapshot = self.runtime.snapshot(true);
        log_snapshot(&final_snapshot);
        if let Some(sink) = &self.sink {
            if sink.send(final_snapshot.clone()).await.is_err() {
                tracing::debug!("Snapshot sink closed before final snapshot");
            }
        }

        self.runtime.reset();
        tracing::info!(completed, failed, "All virtual users finished");

        Ok(RunSummary {
            virtual_users: total,
            failed,
            final_snapshot,
        })
    }
}

async fn snapshot_loop(
    runtime: WorkerRuntime,
    period: Duration,
    sink: Option<mpsc::Sender<RuntimeSnapshot>>,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let snapshot = runtime.snapshot(false);
                log_snapshot(&snapshot);
                if let Some(sink) = &sink {
                    if sink.try_send(snapshot).is_err() {
                        tracing::debug!("Snapshot sink full or closed, dropping snapshot");
                    }
                }
            }
        }
    }
}

fn log_snapshot(snapshot: &RuntimeSnapshot) {
    for unit in &snapshot.units {
        match &unit.value {
            SnapshotValue::Counter(count) => tracing::info!(
                title = %unit.title,
                time = snapshot.timestamp_ms,
                count,
                "counter"
            ),
            SnapshotValue::Histogram(h) => tracing::info!(
                title = %unit.title,
                time = snapshot.timestamp_ms,
                count = h.count,
                min = h.min,
                max = h.max,
                mean = h.mean,
                p95 = h.p95,
                "histogram"
            ),
            SnapshotValue::Gauge(value) => tracing::info!(
                title = %unit.title,
                time = snapshot.timestamp_ms,
                value,
                "gauge"
            ),
        }
    }
}
