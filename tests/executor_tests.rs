//! The `loadpilot executor` and `loadpilot compile` subcommands, driven the
//! way the master drives them.


use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use loadpilot::proto::{StartRequest, TerminateRequest};
use loadpilot::scenario::CompiledPlan;
use loadpilot::supervisor::{reserve_loopback_addr, wait_for_ready};
use test_harness::{counter_scenario, LOADPILOT_BIN};

fn compile(dir: &Path, source: &str) -> std::process::Output {
    let source_path = dir.join("scenario.toml");
    std::fs::write(&source_path, source).unwrap();
    std::process::Command::new(LOADPILOT_BIN)
        .arg("compile")
        .arg("--source")
        .arg(&source_path)
        .arg("--output")
        .arg(dir.join("scenario.plan"))
        .output()
        .unwrap()
}

#[test]
fn test_compile_writes_plan() {
    let dir = tempfile::tempdir().unwrap();
    let output = compile(dir.path(), &counter_scenario(3));

    assert!(output.status.success());
    let plan = CompiledPlan::load(&dir.path().join("scenario.plan")).unwrap();
    assert_eq!(plan.name, "counter");
    assert_eq!(plan.groups.len(), 1);
    assert_eq!(plan.groups[0].concurrency, 3);
}

#[test]
fn test_compile_reports_errors_on_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let output = compile(dir.path(), "[[group]]\nname = \"\"\nconcurrency = 1\n");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("group name cannot be empty"), "stderr: {stderr}");
    assert!(!dir.path().join("scenario.plan").exists());
}

#[tokio::test]
async fn test_executor_start_then_terminate_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    assert!(compile(dir.path(), &counter_scenario(2)).status.success());

    let executor_addr = reserve_loopback_addr().unwrap();
    // Nothing listens here; snapshot reports fail and are skipped.
    let agent_addr = reserve_loopback_addr().unwrap();

    let mut child = Command::new(LOADPILOT_BIN)
        .arg("executor")
        .arg("--agent-addr")
        .arg(agent_addr.to_string())
        .arg("--executor-addr")
        .arg(executor_addr.to_string())
        .arg("--artifact-path")
        .arg(dir.path().join("scenario.plan"))
        .arg("--job-id")
        .arg(Uuid::new_v4().to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let mut client = wait_for_ready(
        executor_addr,
        Duration::from_secs(10),
        Duration::from_millis(10),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let started = client.start(StartRequest { run: true }).await.unwrap();
    assert!(started.into_inner().accepted);

    let terminated = client.terminate(TerminateRequest { code: 0 }).await.unwrap();
    assert!(terminated.into_inner().accepted);
    drop(client);

    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("executor should exit after terminate")
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_executor_with_missing_artifact_fails() {
    let dir = tempfile::tempdir().unwrap();

    let status = Command::new(LOADPILOT_BIN)
        .arg("executor")
        .arg("--agent-addr")
        .arg(reserve_loopback_addr().unwrap().to_string())
        .arg("--executor-addr")
        .arg(reserve_loopback_addr().unwrap().to_string())
        .arg("--artifact-path")
        .arg(dir.path().join("missing.plan"))
        .arg("--job-id")
        .arg(Uuid::new_v4().to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .unwrap();

    assert!(!status.success());
}

#[tokio::test]
async fn test_executor_rejects_malformed_job_id() {
    let status = Command::new(LOADPILOT_BIN)
        .args(["executor", "--agent-addr", "127.0.0.1:1", "--executor-addr"])
        .arg("127.0.0.1:2")
        .args(["--artifact-path", "/nonexistent", "--job-id", "nope"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .unwrap();

    assert!(!status.success());
}

#[test]
fn test_executor_rejects_zero_snapshot_interval() {
    let output = std::process::Command::new(LOADPILOT_BIN)
        .args(["executor", "--agent-addr", "127.0.0.1:1"])
        .args(["--executor-addr", "127.0.0.1:2"])
        .args(["--artifact-path", "/nonexistent", "--job-id"])
        .arg(Uuid::new_v4().to_string())
        .args(["--snapshot-interval-ms", "0"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--snapshot-interval-ms"), "stderr: {stderr}");
}
