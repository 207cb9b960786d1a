//! # Processor Behavior Tests
//!
//! Exercises the fetch/compare/write pipeline against an in-memory secret
//! store: exact materialization, idempotence, change propagation, pre-flight
//! rejection, and fail-fast behavior before any destination is touched.

mod common;

use common::{spec, vault_ref, InMemoryStore};
use opsync::config::{SecretsConfig, ServiceAction, ServiceBinding, SystemdIntegration};
use opsync::processor::Processor;
use std::os::unix::fs::PermissionsExt;

fn config(secrets: Vec<opsync::config::SecretSpec>) -> SecretsConfig {
    SecretsConfig {
        secrets,
        systemd_integration: SystemdIntegration::default(),
    }
}

#[tokio::test]
async fn test_successful_run_materializes_every_secret_with_exact_bytes() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");
    store.insert(&vault_ref("api"), b"key-material\nwith-newline");
    store.insert(&vault_ref("tls"), &[0u8, 159, 146, 150]);

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let result = Processor::new(&session, dir.path())
        .process(&config(vec![
            spec("db", "db-password"),
            spec("api", "api-key"),
            spec("tls", "certs/tls.key"),
        ]))
        .await
        .unwrap();

    assert_eq!(result.processed_count, 3);
    assert_eq!(
        std::fs::read(dir.path().join("db-password")).unwrap(),
        b"s3cr3t"
    );
    assert_eq!(
        std::fs::read(dir.path().join("api-key")).unwrap(),
        b"key-material\nwith-newline"
    );
    assert_eq!(
        std::fs::read(dir.path().join("certs/tls.key")).unwrap(),
        vec![0u8, 159, 146, 150]
    );
}

#[tokio::test]
async fn test_first_materialization_counts_as_changed() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let result = Processor::new(&session, dir.path())
        .process(&config(vec![spec("db", "db-password")]))
        .await
        .unwrap();

    assert_eq!(result.changed.get("db"), Some(&true));
}

#[tokio::test]
async fn test_rerun_with_unchanged_content_changes_nothing() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");
    store.insert(&vault_ref("api"), b"key");

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let cfg = config(vec![spec("db", "db-password"), spec("api", "api-key")]);
    let processor = Processor::new(&session, dir.path());

    processor.process(&cfg).await.unwrap();
    let second = processor.process(&cfg).await.unwrap();

    assert!(second.changed.values().all(|changed| !changed));
    assert!(second.changed_keys().is_empty());
}

#[tokio::test]
async fn test_single_remote_change_marks_only_that_key() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");
    store.insert(&vault_ref("api"), b"key");

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let cfg = config(vec![spec("db", "db-password"), spec("api", "api-key")]);
    let processor = Processor::new(&session, dir.path());

    processor.process(&cfg).await.unwrap();
    store.insert(&vault_ref("db"), b"n3wpass");
    let result = processor.process(&cfg).await.unwrap();

    assert_eq!(result.changed.get("db"), Some(&true));
    assert_eq!(result.changed.get("api"), Some(&false));
    assert_eq!(
        std::fs::read(dir.path().join("db-password")).unwrap(),
        b"n3wpass"
    );
}

#[tokio::test]
async fn test_duplicate_keys_rejected_before_any_fetch() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let err = Processor::new(&session, dir.path())
        .process(&config(vec![spec("db", "a"), spec("db", "b")]))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("duplicate secret key"));
    assert_eq!(store.fetch_count(), 0);
}

#[tokio::test]
async fn test_duplicate_output_paths_rejected_before_any_fetch() {
    let store = InMemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let err = Processor::new(&session, dir.path())
        .process(&config(vec![spec("db", "same"), spec("api", "same")]))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("already used by secret"));
    assert_eq!(store.fetch_count(), 0);
}

#[tokio::test]
async fn test_missing_secret_aborts_before_any_destination_write() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");
    // "api" is not in the store at all

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let err = Processor::new(&session, dir.path())
        .process(&config(vec![spec("db", "db-password"), spec("api", "api-key")]))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("api"));
    assert!(!dir.path().join("db-password").exists());
    assert!(!dir.path().join("api-key").exists());
}

#[tokio::test]
async fn test_transient_outage_is_retried_to_success() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");
    store.fail_next(&vault_ref("db"), 2);

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let result = Processor::new(&session, dir.path())
        .process(&config(vec![spec("db", "db-password")]))
        .await
        .unwrap();

    assert_eq!(result.changed.get("db"), Some(&true));
    assert_eq!(store.fetch_count(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_abort_the_run_naming_the_secret() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");
    store.fail_next(&vault_ref("db"), 10);

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let err = Processor::new(&session, dir.path())
        .process(&config(vec![spec("db", "db-password")]))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("db"));
    assert!(!dir.path().join("db-password").exists());
}

#[tokio::test]
async fn test_materialized_files_default_to_owner_only_mode() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    Processor::new(&session, dir.path())
        .process(&config(vec![spec("db", "db-password")]))
        .await
        .unwrap();

    let mode = std::fs::metadata(dir.path().join("db-password"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_configured_mode_is_applied() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let mut secret = spec("db", "db-password");
    secret.mode = Some("0640".to_string());
    Processor::new(&session, dir.path())
        .process(&config(vec![secret]))
        .await
        .unwrap();

    let mode = std::fs::metadata(dir.path().join("db-password"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o640);
}

#[tokio::test]
async fn test_no_leftover_temp_files_after_a_run() {
    let store = InMemoryStore::new();
    store.insert(&vault_ref("db"), b"s3cr3t");

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let cfg = config(vec![spec("db", "db-password")]);
    let processor = Processor::new(&session, dir.path());
    processor.process(&cfg).await.unwrap();
    store.insert(&vault_ref("db"), b"n3wpass");
    processor.process(&cfg).await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".opsync-"))
        .collect();
    assert!(leftovers.is_empty(), "leftover temp files: {:?}", leftovers);
}

/// The end-to-end scenario: db-password bound to postgres.service across
/// three runs (create, no-op, rotate).
#[tokio::test]
async fn test_change_driven_reconciliation_scenario() {
    use common::RecordingManager;
    use opsync::reconciler::{build_plan, reconcile};
    use std::time::Duration;

    let store = InMemoryStore::new();
    store.insert(&vault_ref("db-password"), b"s3cr3t");
    store.insert(&vault_ref("unrelated"), b"other");

    let cfg = SecretsConfig {
        secrets: vec![spec("db-password", "db-password"), spec("unrelated", "unrelated")],
        systemd_integration: SystemdIntegration {
            enable: true,
            services: vec![
                ServiceBinding {
                    name: "postgres.service".to_string(),
                    depends_on_keys: vec!["db-password".to_string()],
                    action: ServiceAction::Restart,
                },
                ServiceBinding {
                    name: "other.service".to_string(),
                    depends_on_keys: vec!["unrelated".to_string()],
                    action: ServiceAction::Restart,
                },
            ],
        },
    };

    let dir = tempfile::tempdir().unwrap();
    let session = store.session();
    let processor = Processor::new(&session, dir.path());
    let timeout = Duration::from_secs(5);

    // Run 1: first materialization restarts everything bound to changes
    let manager = RecordingManager::new();
    let result = processor.process(&cfg).await.unwrap();
    let plan = build_plan(&result, &cfg.systemd_integration);
    let report = reconcile(&manager, &plan, timeout).await;
    assert!(report.is_success());
    assert_eq!(
        std::fs::read(dir.path().join("db-password")).unwrap(),
        b"s3cr3t"
    );
    assert_eq!(manager.calls().len(), 2);

    // Run 2: nothing changed remotely, nothing restarts
    let manager = RecordingManager::new();
    let result = processor.process(&cfg).await.unwrap();
    let plan = build_plan(&result, &cfg.systemd_integration);
    assert!(plan.is_empty());
    let report = reconcile(&manager, &plan, timeout).await;
    assert!(report.is_success());
    assert!(manager.calls().is_empty());

    // Run 3: only db-password rotates; the unrelated binding is untouched
    store.insert(&vault_ref("db-password"), b"n3wpass");
    let manager = RecordingManager::new();
    let result = processor.process(&cfg).await.unwrap();
    let plan = build_plan(&result, &cfg.systemd_integration);
    let report = reconcile(&manager, &plan, timeout).await;
    assert!(report.is_success());
    assert_eq!(
        std::fs::read(dir.path().join("db-password")).unwrap(),
        b"n3wpass"
    );
    assert_eq!(
        manager.calls(),
        vec![("postgres.service".to_string(), ServiceAction::Restart)]
    );
}
