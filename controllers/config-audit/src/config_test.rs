//! Unit tests for operator configuration

use super::*;
use cluster_client::MockClusterClient;
use std::collections::HashMap;

fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[test]
fn test_empty_data_yields_defaults() {
    let config = AuditConfig::from_data(&BTreeMap::new()).unwrap();
    assert_eq!(config, AuditConfig::default());
    assert_eq!(config.plugin, "workload-hardening");
    assert_eq!(config.limit_scope, LimitScope::Namespace);
}

#[test]
fn test_parses_all_fields() {
    let config = AuditConfig::from_data(&data(&[
        ("scanInterval", "1h30m"),
        ("maxConcurrentAudits", "2"),
        ("plugin", "plugin-v1"),
        ("targetNamespaces", "team-a, team-b"),
        ("limitScope", "Cluster"),
        ("topLevelKinds", "Deployment,Job"),
        ("auditTimeout", "45s"),
    ]))
    .unwrap();

    assert_eq!(config.scan_interval, Duration::from_secs(5400));
    assert_eq!(config.max_concurrent_audits, 2);
    assert_eq!(config.plugin, "plugin-v1");
    assert_eq!(config.target_namespaces, vec!["team-a", "team-b"]);
    assert_eq!(config.limit_scope, LimitScope::Cluster);
    assert_eq!(config.top_level_kinds, vec!["Deployment", "Job"]);
    assert_eq!(config.audit_timeout, Duration::from_secs(45));
}

#[test]
fn test_malformed_values_are_rejected() {
    let cases = [
        ("scanInterval", "soon"),
        ("scanInterval", "10"),
        ("scanInterval", "0s"),
        ("maxConcurrentAudits", "0"),
        ("maxConcurrentAudits", "-1"),
        ("plugin", "Not_A_Label"),
        ("targetNamespaces", "ok,BAD"),
        ("limitScope", "Node"),
        ("auditTimeout", "5d"),
    ];
    for (key, value) in cases {
        let err = AuditConfig::from_data(&data(&[(key, value)])).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { key: ref k, .. } if k == key),
            "{key}={value} should be rejected, got {err}"
        );
    }
}

#[test]
fn test_unknown_key_is_rejected() {
    let err = AuditConfig::from_data(&data(&[("scanIntervall", "1h")])).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownKey(ref k) if k == "scanIntervall"));
}

#[test]
fn test_to_data_round_trips_defaults() {
    let defaults = AuditConfig::default();
    assert_eq!(AuditConfig::from_data(&defaults.to_data()).unwrap(), defaults);
}

#[test]
fn test_scope_key_follows_limit_scope() {
    let subject = ResourceRef::new("apps/v1", "Deployment", "ns", "app-1");
    let mut config = AuditConfig::default();
    assert_eq!(config.scope_key(&subject), "ns");

    config.limit_scope = LimitScope::Cluster;
    assert_eq!(config.scope_key(&subject), CLUSTER_SCOPE);
}

#[test]
fn test_in_scope() {
    let mut config = AuditConfig::default();
    assert!(config.in_scope(Some("anything")));

    config.target_namespaces = vec!["team-a".to_string()];
    assert!(config.in_scope(Some("team-a")));
    assert!(!config.in_scope(Some("team-b")));
    assert!(!config.in_scope(None));
}

#[test]
fn test_settings_defaults() {
    let settings = OperatorSettings::from_lookup(|_| None).unwrap();
    assert_eq!(settings.namespace, DEFAULT_OPERATOR_NAMESPACE);
    assert_eq!(settings.config_name, DEFAULT_CONFIG_NAME);
    assert_eq!(settings.health_addr.port(), 8081);
    assert_eq!(settings.worker_concurrency, 3);
}

#[test]
fn test_settings_from_lookup() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("OPERATOR_NAMESPACE", "audit"),
        ("HEALTH_PROBE_ADDR", "127.0.0.1:9000"),
        ("WORKER_CONCURRENCY", "8"),
    ]);
    let settings = OperatorSettings::from_lookup(|k| env.get(k).map(|v| (*v).to_string())).unwrap();
    assert_eq!(settings.namespace, "audit");
    assert_eq!(settings.health_addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
    assert_eq!(settings.worker_concurrency, 8);

    let bad = OperatorSettings::from_lookup(|k| (k == "WORKER_CONCURRENCY").then(|| "0".to_string()));
    assert!(bad.is_err());
}

#[tokio::test]
async fn test_ensure_default_creates_config_once() {
    let mock = MockClusterClient::new();
    let manager = ConfigManager::new(Arc::new(mock.clone()), "audit", "config-audit");

    manager.ensure_default().await.unwrap();
    let created = mock.config_map("audit", "config-audit").expect("config map created");
    assert_eq!(created.data, Some(AuditConfig::default().to_data()));

    // Second call leaves the existing object alone
    manager.ensure_default().await.unwrap();
    assert_eq!(manager.read().await.unwrap(), AuditConfig::default());
}

#[tokio::test]
async fn test_read_rejects_invalid_config_map() {
    let mock = MockClusterClient::new();
    mock.add_config_map(ConfigMap {
        metadata: ObjectMeta {
            name: Some("config-audit".to_string()),
            namespace: Some("audit".to_string()),
            ..ObjectMeta::default()
        },
        data: Some(data(&[("maxConcurrentAudits", "many")])),
        ..ConfigMap::default()
    });
    let manager = ConfigManager::new(Arc::new(mock), "audit", "config-audit");

    manager.ensure_default().await.unwrap();
    assert!(matches!(manager.read().await, Err(ConfigError::Invalid { .. })));
}

#[tokio::test]
async fn test_read_missing_config_map_is_an_error() {
    let manager = ConfigManager::new(Arc::new(MockClusterClient::new()), "audit", "config-audit");
    assert!(matches!(manager.read().await, Err(ConfigError::Cluster(_))));
}
