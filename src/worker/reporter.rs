use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};
use uuid::Uuid;

use crate::error::Result;
use crate::proto::agent_service_client::AgentServiceClient;
use crate::proto::{self, MetricKind as ProtoMetricKind};
use crate::worker::metrics::{SnapshotValue, UnitSnapshot};
use crate::worker::runtime::RuntimeSnapshot;

/// Forwards runtime snapshots to the master's agent endpoint.
pub struct SnapshotReporter {
    job_id: Uuid,
    client: AgentServiceClient<Channel>,
}

impl SnapshotReporter {
    /// The connection is established on first use, so a missing agent only
    /// costs failed reports.
    pub fn new(job_id: Uuid, agent_addr: SocketAddr) -> Result<Self> {
        let channel = Endpoint::from_shared(format!("http://{}", agent_addr))?
            .connect_timeout(Duration::from_secs(1))
            .connect_lazy();
        Ok(Self {
            job_id,
            client: AgentServiceClient::new(channel),
        })
    }

    /// Run until every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<RuntimeSnapshot>) {
        while let Some(snapshot) = rx.recv().await {
            let is_final = snapshot.is_final;
            let request = snapshot_to_proto(self.job_id, &snapshot);
            match self.client.report_snapshot(request).await {
                Ok(_) => {
                    tracing::debug!(job_id = %self.job_id, is_final, "Snapshot reported");
                }
                Err(status) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        is_final,
                        error = %status,
                        "Failed to report snapshot to agent"
                    );
                }
            }
        }
    }
}

pub fn snapshot_to_proto(job_id: Uuid, snapshot: &RuntimeSnapshot) -> proto::MetricSnapshot {
    proto::MetricSnapshot {
        job_id: job_id.to_string(),
        hostname: snapshot.hostname.clone(),
        pid: snapshot.pid,
        timestamp_ms: snapshot.timestamp_ms,
        is_final: snapshot.is_final,
        units: snapshot.units.iter().map(unit_to_proto).collect(),
    }
}

fn unit_to_proto(unit: &UnitSnapshot) -> proto::UnitSnapshot {
    match &unit.value {
        SnapshotValue::Counter(count) => proto::UnitSnapshot {
            title: unit.title.clone(),
            kind: ProtoMetricKind::Counter as i32,
            value: *count,
            histogram: None,
        },
        SnapshotValue::Gauge(value) => proto::UnitSnapshot {
            title: unit.title.clone(),
            kind: ProtoMetricKind::Gauge as i32,
            value: *value,
            histogram: None,
        },
        SnapshotValue::Histogram(h) => proto::UnitSnapshot {
            title: unit.title.clone(),
            kind: ProtoMetricKind::Histogram as i32,
            value: i64::try_from(h.count).unwrap_or(i64::MAX),
            histogram: Some(proto::HistogramSummary {
                count: h.count,
                min: h.min,
                max: h.max,
                mean: h.mean,
                stddev: h.stddev,
                p50: h.p50,
                p95: h.p95,
                p99: h.p99,
            }),
        },
    }
}
