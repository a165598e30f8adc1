//! End-to-end tests: a master running in-process, scenarios compiled and
//! executed by the real `loadpilot` binary.


use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use uuid::Uuid;

use loadpilot::config::{CompilerConfig, ExecutorConfig};
use loadpilot::proto::{
    CancelJobRequest, GetJobStatusRequest, JobState as ProtoJobState, ListJobsRequest,
    SubmitJobRequest,
};
use loadpilot::scheduler::JobState;
use test_harness::{
    assert_eventually, counter_scenario, test_master_config, TestMaster,
};

const JOB_TIMEOUT: Duration = Duration::from_secs(30);

async fn start_http_target() -> SocketAddr {
    let app = Router::new()
        .route("/ok", get(|| async { "ok" }))
        .route(
            "/fail",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "nope") }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Three virtual users each count one request; the final snapshot says 3.
#[tokio::test]
async fn test_counter_scenario_finishes_with_expected_count() {
    let master = TestMaster::start(test_master_config()).await;
    let mut client = master.client().await;

    let response = client
        .submit_job(SubmitJobRequest {
            name: "counter".to_string(),
            scenario: counter_scenario(3),
        })
        .await
        .unwrap()
        .into_inner();
    let job_id = Uuid::parse_str(&response.job_id).unwrap();

    let job = master.wait_terminal(&job_id, JOB_TIMEOUT).await;
    assert_eq!(job.state, JobState::Finished, "error: {:?}", job.error);
    assert!(job.error.is_none());

    assert_eventually(
        || async {
            master
                .snapshots
                .latest(&job_id)
                .await
                .map(|s| s.is_final)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        "final snapshot should be recorded",
    )
    .await;

    let info = client
        .get_job_status(GetJobStatusRequest {
            job_id: job_id.to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.state, ProtoJobState::Finished as i32);
    let reqs = info.metrics.iter().find(|m| m.title == "reqs").unwrap();
    assert_eq!(reqs.value, 3);

    master.stop().await;
}

/// Cancel issued while the scenario is still compiling.
#[tokio::test]
async fn test_cancel_before_compile_completes() {
    let config =
        test_master_config().with_compiler(CompilerConfig::new("sleep").with_args(["10"]));
    let master = TestMaster::start(config).await;
    let mut client = master.client().await;

    let job_id = master.submit(&counter_scenario(1)).await;
    assert_eventually(
        || async { master.scheduler.active_job() == Some(job_id) },
        Duration::from_secs(5),
        "job should start provisioning",
    )
    .await;
    assert_eq!(master.state(&job_id).await, Some(JobState::Provisioning));

    let response = client
        .cancel_job(CancelJobRequest {
            job_id: job_id.to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(response.cancelled);

    let job = master.wait_terminal(&job_id, Duration::from_secs(5)).await;
    assert_eq!(job.state, JobState::Cancel);
    assert_eq!(
        job.error.as_deref(),
        Some(format!("Job {} is canceled", job_id).as_str())
    );

    master.stop().await;
}

/// Invalid source fails compilation and never reaches an executor.
#[tokio::test]
async fn test_invalid_scenario_errors_without_executor() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("executor-spawned");
    let executor = ExecutorConfig::new("sh")
        .with_leading_args(["-c", &format!("touch {}", marker.display())])
        .with_ready_timeout_ms(200);
    let master = TestMaster::start(test_master_config().with_executor(executor)).await;

    let job_id = master.submit("[[group]]\nname = \"a\"\nconcurrency = 0\n").await;

    let job = master.wait_terminal(&job_id, JOB_TIMEOUT).await;
    assert_eq!(job.state, JobState::Error);
    let error = job.error.unwrap();
    assert!(error.contains("at least one virtual user"), "error: {error}");
    assert!(!marker.exists(), "executor must not be spawned");

    master.stop().await;
}

#[tokio::test]
async fn test_http_steps_record_latency_and_errors() {
    let target = start_http_target().await;
    let scenario = format!(
        r#"
name = "http"

[[group]]
name = "ok"
concurrency = 2
iterations = 3

[[group.graph]]
title = "Latency"
unit = "ms"

[[group.graph.metric]]
title = "latency"
kind = "histogram"

[[group.step]]
action = "http"
url = "http://{target}/ok"
latency = "latency"
errors = "errors"

[[group]]
name = "failing"
concurrency = 1
iterations = 2

[[group.graph]]
title = "Errors"

[[group.graph.metric]]
title = "errors"
kind = "counter"

[[group.step]]
action = "http"
url = "http://{target}/fail"
errors = "errors"
"#
    );

    let master = TestMaster::start(test_master_config()).await;
    let job_id = master.submit(&scenario).await;

    let job = master.wait_terminal(&job_id, JOB_TIMEOUT).await;
    assert_eq!(job.state, JobState::Finished, "error: {:?}", job.error);

    assert_eventually(
        || async {
            master
                .snapshots
                .latest(&job_id)
                .await
                .map(|s| s.is_final)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        "final snapshot should be recorded",
    )
    .await;
    let snapshot = master.snapshots.latest(&job_id).await.unwrap();

    let latency = snapshot.units.iter().find(|u| u.title == "latency").unwrap();
    assert_eq!(latency.histogram.as_ref().unwrap().count, 6);
    let errors = snapshot.units.iter().find(|u| u.title == "errors").unwrap();
    assert_eq!(errors.value, 2);

    master.stop().await;
}

#[tokio::test]
async fn test_jobs_run_in_submission_order() {
    let master = TestMaster::start(test_master_config()).await;
    let mut client = master.client().await;

    let mut ids = Vec::new();
    for i in 0..2 {
        let response = client
            .submit_job(SubmitJobRequest {
                name: format!("job-{i}"),
                scenario: counter_scenario(1),
            })
            .await
            .unwrap()
            .into_inner();
        ids.push(Uuid::parse_str(&response.job_id).unwrap());
    }

    let first = master.wait_terminal(&ids[0], JOB_TIMEOUT).await;
    let second = master.wait_terminal(&ids[1], JOB_TIMEOUT).await;
    assert_eq!(first.state, JobState::Finished);
    assert_eq!(second.state, JobState::Finished);
    assert!(first.updated_at <= second.updated_at);

    let listed = client
        .list_jobs(ListJobsRequest {})
        .await
        .unwrap()
        .into_inner()
        .jobs;
    let listed_ids: Vec<String> = listed.into_iter().map(|j| j.job_id).collect();
    assert_eq!(listed_ids, vec![ids[0].to_string(), ids[1].to_string()]);

    master.stop().await;
}

#[tokio::test]
async fn test_cancel_unknown_job_is_rejected() {
    let master = TestMaster::start(test_master_config()).await;
    let mut client = master.client().await;

    let status = client
        .cancel_job(CancelJobRequest {
            job_id: Uuid::new_v4().to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);

    let status = client
        .cancel_job(CancelJobRequest {
            job_id: "not-a-uuid".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    master.stop().await;
}

#[tokio::test]
async fn test_shutdown_cancels_active_job() {
    let config =
        test_master_config().with_compiler(CompilerConfig::new("sleep").with_args(["10"]));
    let master = TestMaster::start(config).await;
    let store = master.store.clone();

    let job_id = master.submit(&counter_scenario(1)).await;
    assert_eventually(
        || async { master.scheduler.active_job() == Some(job_id) },
        Duration::from_secs(5),
        "job should become active",
    )
    .await;

    master.stop().await;

    let job = store.get(&job_id).await.unwrap();
    assert_eq!(job.state, JobState::Cancel);
}
