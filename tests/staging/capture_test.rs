//! Capture steps against the scripted stack.

use nextcloud_backup::capture::{
    capture_data, capture_database, capture_volume, verify_artifacts, verify_gzip, APP_ARCHIVE,
    DATABASE_DUMP, DATA_ARCHIVE,
};
use nextcloud_backup::credentials::Secret;
use nextcloud_backup::run::RunId;
use nextcloud_backup::staging::StagingDir;

use crate::support::{FakeStack, DUMP_SQL, PASSWORD};

fn staging_for(stack: &FakeStack) -> StagingDir {
    let run_id = RunId::parse("20261016_031500").expect("valid run id");
    StagingDir::create(&stack.staging_root(), &run_id).expect("should create staging")
}

#[tokio::test]
async fn database_dump_is_gzip_compressed_sql() {
    let stack = FakeStack::new();
    let config = stack.config();
    let staging = staging_for(&stack);

    let size = capture_database(&stack, &config.stack, &Secret::new(PASSWORD), &staging)
        .await
        .expect("dump should succeed");

    assert!(size > 0);
    let sql_bytes = verify_gzip(&staging.file(DATABASE_DUMP)).expect("valid gzip");
    assert_eq!(usize::try_from(sql_bytes).ok(), Some(DUMP_SQL.len()));
}

#[tokio::test]
async fn empty_dump_is_rejected() {
    let stack = FakeStack::new();
    let config = stack.config();
    let staging = staging_for(&stack);

    // Wrong password makes the fake mysqldump fail before writing anything.
    let result = capture_database(&stack, &config.stack, &Secret::new("wrong"), &staging).await;
    assert!(result.is_err());
    assert!(!staging.file(DATABASE_DUMP).exists());
}

#[tokio::test]
async fn data_capture_requires_existing_directory() {
    let stack = FakeStack::new();
    let mut config = stack.config();
    config.stack.data_dir = stack.root().join("missing");
    let staging = staging_for(&stack);

    let err = capture_data(&stack, &config.stack, &staging)
        .await
        .expect_err("missing data dir should fail");
    assert!(err.to_string().contains("does not exist"));
    assert_eq!(stack.count("tar"), 0);
}

#[tokio::test]
async fn data_capture_archives_relative_to_parent() {
    let stack = FakeStack::new();
    let config = stack.config();
    let staging = staging_for(&stack);

    capture_data(&stack, &config.stack, &staging)
        .await
        .expect("data capture should succeed");

    let call = stack
        .invocations()
        .into_iter()
        .find(|inv| inv.program() == "tar")
        .expect("tar invocation");
    let args = call.arguments();
    assert_eq!(args.last().map(String::as_str), Some("data"));
    let parent = stack.root().join("srv").display().to_string();
    assert!(args.contains(&parent));
    assert!(staging.file(DATA_ARCHIVE).is_file());
}

#[tokio::test]
async fn volume_capture_mounts_read_only_and_removes_scratch() {
    let stack = FakeStack::new();
    let config = stack.config();
    let staging = staging_for(&stack);

    capture_volume(&stack, &config.stack, &staging, &stack.staging_root())
        .await
        .expect("volume capture should succeed");

    assert!(staging.file(APP_ARCHIVE).is_file());
    assert_eq!(stack.count("nextcloud_app:/source:ro"), 1);
    assert_eq!(
        stack.staging_entries(),
        vec!["nextcloud_backup_20261016_031500".to_owned()],
        "scratch directory should be gone"
    );
}

#[tokio::test]
async fn verify_artifacts_after_full_capture() {
    let stack = FakeStack::new();
    let config = stack.config();
    let staging = staging_for(&stack);

    assert!(verify_artifacts(staging.path()).is_err());
    capture_database(&stack, &config.stack, &Secret::new(PASSWORD), &staging)
        .await
        .expect("dump");
    capture_data(&stack, &config.stack, &staging)
        .await
        .expect("data");
    capture_volume(&stack, &config.stack, &staging, &stack.staging_root())
        .await
        .expect("volume");
    assert!(verify_artifacts(staging.path()).is_ok());
}
