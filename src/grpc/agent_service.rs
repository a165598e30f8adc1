use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::proto::agent_service_server::AgentService;
use crate::proto::{MetricSnapshot, ReportSnapshotResponse};

/// Latest metric snapshot reported for each job.
#[derive(Debug, Clone, Default)]
pub struct SnapshotBook {
    snapshots: Arc<RwLock<HashMap<Uuid, MetricSnapshot>>>,
}

impl SnapshotBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `snapshot` as the latest for `job_id`.
    ///
    /// A final snapshot is never replaced by a periodic one that arrives
    /// late. Returns whether the snapshot was kept.
    pub async fn record(&self, job_id: Uuid, snapshot: MetricSnapshot) -> bool {
        let mut snapshots = self.snapshots.write().await;
        if let Some(existing) = snapshots.get(&job_id) {
            if existing.is_final && !snapshot.is_final {
                return false;
            }
        }
        snapshots.insert(job_id, snapshot);
        true
    }

    pub async fn latest(&self, job_id: &Uuid) -> Option<MetricSnapshot> {
        self.snapshots.read().await.get(job_id).cloned()
    }

    pub async fn remove(&self, job_id: &Uuid) -> Option<MetricSnapshot> {
        self.snapshots.write().await.remove(job_id)
    }
}

/// Agent endpoint executors report their metrics to.
pub struct AgentServiceImpl {
    book: SnapshotBook,
}

impl AgentServiceImpl {
    pub fn new(book: SnapshotBook) -> Self {
        Self { book }
    }
}

#[tonic::async_trait]
impl AgentService for AgentServiceImpl {
    async fn report_snapshot(
        &self,
        request: Request<MetricSnapshot>,
    ) -> Result<Response<ReportSnapshotResponse>, Status> {
        let snapshot = request.into_inner();
        let job_id = Uuid::parse_str(&snapshot.job_id)
            .map_err(|_| Status::invalid_argument("Invalid job ID"))?;

        tracing::debug!(
            job_id = %job_id,
            hostname = %snapshot.hostname,
            pid = snapshot.pid,
            is_final = snapshot.is_final,
            units = snapshot.units.len(),
            "Snapshot received"
        );
        let accepted = self.book.record(job_id, snapshot).await;

        Ok(Response::new(ReportSnapshotResponse { accepted }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(job_id: Uuid, is_final: bool, timestamp_ms: i64) -> MetricSnapshot {
        MetricSnapshot {
            job_id: job_id.to_string(),
            hostname: "host".to_string(),
            pid: 1,
            timestamp_ms,
            is_final,
            units: Vec::new(),
        }
    }

    #[tokio::test]
    async fn keeps_newest_periodic_snapshot() {
        let book = SnapshotBook::new();
        let id = Uuid::new_v4();

        assert!(book.record(id, snapshot(id, false, 1)).await);
        assert!(book.record(id, snapshot(id, false, 2)).await);
        assert_eq!(book.latest(&id).await.unwrap().timestamp_ms, 2);
    }

    #[tokio::test]
    async fn final_snapshot_is_not_overwritten() {
        let book = SnapshotBook::new();
        let id = Uuid::new_v4();

        book.record(id, snapshot(id, true, 5)).await;
        assert!(!book.record(id, snapshot(id, false, 6)).await);

        let latest = book.latest(&id).await.unwrap();
        assert!(latest.is_final);
        assert_eq!(latest.timestamp_ms, 5);
    }

    #[tokio::test]
    async fn rejects_malformed_job_id() {
        let service = AgentServiceImpl::new(SnapshotBook::new());
        let mut bad = snapshot(Uuid::new_v4(), false, 1);
        bad.job_id = "not-a-uuid".to_string();

        let status = service
            .report_snapshot(Request::new(bad))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
