//! Unit tests for report persistence

use super::*;
use cluster_client::MockClusterClient;
use crds::AuditOutcome;
use serde_json::json;

fn record(payload: serde_json::Value) -> AuditResultRecord {
    AuditResultRecord {
        outcome: AuditOutcome::Succeeded,
        payload,
        error: None,
    }
}

fn key() -> ReportKey {
    ReportKey::new(
        ResourceRef::new("apps/v1", "Deployment", "ns", "app-1").with_uid("uid-app-1"),
        "plugin-v1",
    )
}

#[tokio::test]
async fn test_upsert_creates_then_replaces_in_place() {
    let mock = MockClusterClient::new();
    let store = ReportReadWriter::new(Arc::new(mock.clone()));

    let first = store.upsert(&key(), "1.0.0", Some(1), record(json!("PASS"))).await.unwrap();
    let second = store.upsert(&key(), "1.0.0", Some(2), record(json!("FAIL"))).await.unwrap();

    assert_eq!(mock.reports().len(), 1);
    assert_eq!(second.metadata.name, first.metadata.name);
    assert_eq!(second.spec.created_at, first.spec.created_at);
    assert_eq!(second.spec.subject_generation, Some(2));
    assert_eq!(second.spec.result.payload, json!("FAIL"));
    assert_ne!(second.metadata.resource_version, first.metadata.resource_version);
}

#[tokio::test]
async fn test_report_metadata() {
    let mock = MockClusterClient::new();
    let store = ReportReadWriter::new(Arc::new(mock.clone()));

    let report = store.upsert(&key(), "1.0.0", Some(1), record(json!("PASS"))).await.unwrap();

    assert_eq!(report.metadata.name.as_deref(), Some("deployment-app-1-plugin-v1"));
    assert_eq!(report.metadata.namespace.as_deref(), Some("ns"));
    let labels = report.metadata.labels.unwrap();
    assert_eq!(labels.get(crds::LABEL_PLUGIN).map(String::as_str), Some("plugin-v1"));
    let owner = &report.metadata.owner_references.unwrap()[0];
    assert_eq!(owner.uid, "uid-app-1");
    assert_eq!(owner.kind, "Deployment");
}

#[tokio::test]
async fn test_distinct_plugins_get_distinct_reports() {
    let mock = MockClusterClient::new();
    let store = ReportReadWriter::new(Arc::new(mock.clone()));
    let subject = key().subject;

    store
        .upsert(&ReportKey::new(subject.clone(), "plugin-v1"), "1.0.0", None, record(json!(1)))
        .await
        .unwrap();
    store
        .upsert(&ReportKey::new(subject, "plugin-v2"), "1.0.0", None, record(json!(2)))
        .await
        .unwrap();

    assert_eq!(mock.reports().len(), 2);
}

#[tokio::test]
async fn test_upsert_retries_conflicts() {
    let mock = MockClusterClient::new();
    let store = ReportReadWriter::new(Arc::new(mock.clone()));
    store.upsert(&key(), "1.0.0", Some(1), record(json!("PASS"))).await.unwrap();

    mock.inject_replace_conflicts(2);
    let report = store.upsert(&key(), "1.0.0", Some(2), record(json!("FAIL"))).await.unwrap();
    assert_eq!(report.spec.result.payload, json!("FAIL"));
}

#[tokio::test]
async fn test_upsert_gives_up_after_max_attempts() {
    let mock = MockClusterClient::new();
    let store = ReportReadWriter::new(Arc::new(mock.clone()));
    store.upsert(&key(), "1.0.0", Some(1), record(json!("PASS"))).await.unwrap();

    mock.inject_replace_conflicts(DEFAULT_MAX_ATTEMPTS);
    let err = store.upsert(&key(), "1.0.0", Some(2), record(json!("FAIL"))).await.unwrap_err();

    assert!(matches!(err, StoreError::ConflictExhausted { attempts: DEFAULT_MAX_ATTEMPTS, .. }));
    assert_eq!(err.kind(), FailureKind::Retryable);
    // Losing writer left the stored report untouched
    assert_eq!(store.get(&key()).await.unwrap().spec.result.payload, json!("PASS"));
}

#[tokio::test]
async fn test_concurrent_upserts_leave_one_report() {
    let mock = MockClusterClient::new();
    let store = ReportReadWriter::new(Arc::new(mock.clone()));
    let payload_a = json!({"p": "A", "q": "A"});
    let payload_b = json!({"p": "B", "q": "B"});
    let key_a = key();
    let key_b = key();

    // Both writers read "missing" before either creates
    let (a, b) = tokio::join!(
        store.upsert(&key_a, "1.0.0", Some(1), record(payload_a.clone())),
        store.upsert(&key_b, "1.0.0", Some(1), record(payload_b.clone())),
    );
    a.unwrap();
    b.unwrap();

    let reports = mock.reports();
    assert_eq!(reports.len(), 1);
    let payload = &reports[0].spec.result.payload;
    assert!(*payload == payload_a || *payload == payload_b, "torn payload {}", payload);
    assert_eq!(mock.report_writes(), 2);
    assert!(mock.write_conflicts() >= 1);
}

#[tokio::test]
async fn test_unchanged_upsert_only_moves_updated_at() {
    let mock = MockClusterClient::new();
    let store = ReportReadWriter::new(Arc::new(mock.clone()));

    let first = store.upsert(&key(), "1.0.0", Some(1), record(json!("PASS"))).await.unwrap();
    let second = store.upsert(&key(), "1.0.0", Some(1), record(json!("PASS"))).await.unwrap();

    assert_eq!(mock.reports().len(), 1);
    assert_eq!(
        second.spec,
        ConfigAuditReportSpec {
            updated_at: second.spec.updated_at,
            ..first.spec.clone()
        }
    );
    assert_eq!(second.metadata.owner_references, first.metadata.owner_references);
}

#[tokio::test]
async fn test_recreated_subject_takes_over_controller_ref() {
    let mock = MockClusterClient::new();
    let store = ReportReadWriter::new(Arc::new(mock.clone()));
    store.upsert(&key(), "1.0.0", Some(1), record(json!("PASS"))).await.unwrap();

    let recreated = ReportKey::new(
        ResourceRef::new("apps/v1", "Deployment", "ns", "app-1").with_uid("uid-NEW"),
        "plugin-v1",
    );
    let report = store.upsert(&recreated, "1.0.0", Some(1), record(json!("PASS"))).await.unwrap();

    let owners = report.metadata.owner_references.unwrap();
    let controllers: Vec<_> = owners.iter().filter(|o| o.controller == Some(true)).collect();
    assert_eq!(controllers.len(), 1);
    assert_eq!(controllers[0].uid, "uid-NEW");
    assert!(owners.iter().all(|o| o.uid != "uid-app-1"));
    assert_eq!(report.spec.subject.uid.as_deref(), Some("uid-NEW"));
}

#[tokio::test]
async fn test_foreign_owner_refs_survive_rewrite() {
    let mock = MockClusterClient::new();
    let store = ReportReadWriter::new(Arc::new(mock.clone()));
    let mut stored = store.upsert(&key(), "1.0.0", Some(1), record(json!("PASS"))).await.unwrap();

    let foreign = OwnerReference {
        api_version: "v1".to_string(),
        kind: "ConfigMap".to_string(),
        name: "audit-index".to_string(),
        uid: "uid-index".to_string(),
        controller: None,
        block_owner_deletion: None,
    };
    stored.metadata.owner_references.get_or_insert_with(Vec::new).push(foreign.clone());
    mock.add_report(stored);

    let report = store.upsert(&key(), "1.0.0", Some(2), record(json!("FAIL"))).await.unwrap();
    let owners = report.metadata.owner_references.unwrap();
    assert_eq!(owners.len(), 2);
    assert!(owners.contains(&foreign));
}

#[tokio::test]
async fn test_delete_missing_report_is_not_found() {
    let store = ReportReadWriter::new(Arc::new(MockClusterClient::new()));
    assert!(matches!(store.delete(&key()).await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_cluster_scoped_subject_is_rejected() {
    let store = ReportReadWriter::new(Arc::new(MockClusterClient::new()));
    let mut subject = key().subject;
    subject.namespace = None;

    let err = store
        .upsert(&ReportKey::new(subject, "plugin-v1"), "1.0.0", None, record(json!(null)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Permanent);
}
