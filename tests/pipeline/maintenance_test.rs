//! Maintenance mode is restored exactly once once enabling was attempted,
//! and never touched when the run fails earlier.

use nextcloud_backup::pipeline::{BackupRun, RunState};
use nextcloud_backup::run::RunId;

use crate::support::{FakeStack, Tamper};

const DISABLE: &str = "maintenance:mode --off";

async fn run(stack: &FakeStack) -> nextcloud_backup::pipeline::RunReport {
    let config = stack.config();
    let run_id = RunId::parse("20261016_031500").expect("valid run id");
    BackupRun::new(&config, stack, run_id)
        .execute(std::future::pending())
        .await
}

#[tokio::test]
async fn restore_attempted_once_for_failures_after_enable() {
    let cases = [
        ("maintenance:mode --on", RunState::MaintenanceOn),
        ("mysqldump --single-transaction", RunState::CaptureDb),
        ("nextcloud-data.tar.gz", RunState::CaptureData),
        ("docker run", RunState::CaptureVolume),
        ("'mkdir'", RunState::Transport),
        ("rsync", RunState::Transport),
    ];

    for (pattern, state) in cases {
        let stack = FakeStack::new().failing_on(pattern);
        let report = run(&stack).await;

        assert_eq!(
            report.error.as_ref().map(|e| e.state),
            Some(state),
            "failure on {pattern}"
        );
        assert_eq!(report.exit_code(), 1, "failure on {pattern}");
        assert_eq!(
            stack.count(DISABLE),
            1,
            "failure on {pattern} should restore exactly once"
        );
        assert!(stack.staging_entries().is_empty(), "failure on {pattern}");
    }
}

#[tokio::test]
async fn restore_attempted_once_when_manifest_write_fails() {
    let stack = FakeStack::new().tampering_on("hostname", Tamper::BlockManifest);
    let report = run(&stack).await;

    assert_eq!(
        report.error.as_ref().map(|e| e.state),
        Some(RunState::Manifest)
    );
    assert_eq!(report.exit_code(), 1);
    assert_eq!(stack.count(DISABLE), 1);
    assert_eq!(stack.count("rsync"), 0);
    assert!(stack.staging_entries().is_empty());
}

#[tokio::test]
async fn restore_attempted_once_when_cleanup_fails() {
    let stack = FakeStack::new().tampering_on("'du'", Tamper::ReplaceStaging);
    let report = run(&stack).await;

    assert_eq!(
        report.error.as_ref().map(|e| e.state),
        Some(RunState::Cleanup)
    );
    assert_eq!(report.exit_code(), 1);
    assert_eq!(stack.count(DISABLE), 1);
    assert_eq!(stack.remote_files().len(), 1, "upload already happened");
    assert!(report.warnings.iter().any(|w| w.starts_with("cleanup")));
}

#[tokio::test]
async fn restore_attempted_once_when_it_fails_or_retention_fails() {
    for pattern in [DISABLE, "'find'", "'du'"] {
        let stack = FakeStack::new().failing_on(pattern);
        let report = run(&stack).await;

        assert_eq!(report.exit_code(), 0, "failure on {pattern}");
        assert_eq!(stack.count(DISABLE), 1, "failure on {pattern}");
    }
}

#[tokio::test]
async fn no_restore_for_failures_before_enable() {
    let missing_tool = FakeStack::new().without_tool("rsync");
    let report = run(&missing_tool).await;
    assert_eq!(
        report.error.as_ref().map(|e| e.state),
        Some(RunState::Preflight)
    );
    assert!(report
        .error
        .as_ref()
        .is_some_and(|e| e.to_string().contains("rsync")));
    assert_eq!(missing_tool.count("maintenance:mode"), 0);

    let docker_down = FakeStack::new().failing_on("docker ps");
    let report = run(&docker_down).await;
    assert_eq!(
        report.error.as_ref().map(|e| e.state),
        Some(RunState::HealthCheck)
    );
    assert_eq!(docker_down.count("maintenance:mode"), 0);

    let blocked = FakeStack::new();
    std::fs::write(blocked.staging_root(), b"not a directory").expect("should block staging root");
    let report = run(&blocked).await;
    assert_eq!(
        report.error.as_ref().map(|e| e.state),
        Some(RunState::Stage)
    );
    assert_eq!(blocked.count("maintenance:mode"), 0);
}

#[tokio::test]
async fn manifest_lookups_degrade_without_failing() {
    let stack = FakeStack::new()
        .failing_on("hostname")
        .failing_on("occ status")
        .failing_on("mysqldump --version");
    let report = run(&stack).await;

    assert!(report.succeeded(), "run failed: {:?}", report.error);
    assert_eq!(stack.count(DISABLE), 1);
}
