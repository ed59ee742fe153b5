//! Operator configuration.
//!
//! Two layers:
//! - `OperatorSettings`: bootstrap values from environment variables
//!   (namespace, config object name, probe address, worker concurrency).
//! - `AuditConfig`: audit settings stored in a single named `ConfigMap`.
//!   `ConfigManager::ensure_default` creates it with defaults on first start;
//!   `ConfigManager::read` parses it strictly. A malformed or unknown field is
//!   a startup error, never silently defaulted.
//!
//! The parsed `AuditConfig` is constructed once in `main` and passed into
//! every component; nothing reads it before `ensure_default` + `read` ran.

use cluster_client::{ClusterClientTrait, ClusterError};
use crds::ResourceRef;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Default name of the operator config object
pub const DEFAULT_CONFIG_NAME: &str = "config-audit";
/// Default operator namespace
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "config-audit-system";
/// Scope key used when limiting cluster-wide
pub const CLUSTER_SCOPE: &str = "*";

const KEY_SCAN_INTERVAL: &str = "scanInterval";
const KEY_MAX_CONCURRENT_AUDITS: &str = "maxConcurrentAudits";
const KEY_PLUGIN: &str = "plugin";
const KEY_TARGET_NAMESPACES: &str = "targetNamespaces";
const KEY_LIMIT_SCOPE: &str = "limitScope";
const KEY_TOP_LEVEL_KINDS: &str = "topLevelKinds";
const KEY_AUDIT_TIMEOUT: &str = "auditTimeout";

const KNOWN_KEYS: [&str; 7] = [
    KEY_SCAN_INTERVAL,
    KEY_MAX_CONCURRENT_AUDITS,
    KEY_PLUGIN,
    KEY_TARGET_NAMESPACES,
    KEY_LIMIT_SCOPE,
    KEY_TOP_LEVEL_KINDS,
    KEY_AUDIT_TIMEOUT,
];

/// Configuration errors (fatal at startup)
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is present but cannot be parsed
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Field name
        key: String,
        /// Raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A field name is not recognised
    #[error("unknown configuration key {0:?}")]
    UnknownKey(String),

    /// The configured plugin is not registered
    #[error("unknown audit plugin {name:?} (available: {available})")]
    UnknownPlugin {
        /// Configured name
        name: String,
        /// Registered names, comma separated
        available: String,
    },

    /// Reading or creating the config object failed
    #[error("config object unavailable: {0}")]
    Cluster(#[from] ClusterError),
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Domain against which concurrent audits are capped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// One cap per namespace
    Namespace,
    /// One cap for the whole cluster
    Cluster,
}

impl LimitScope {
    fn as_str(self) -> &'static str {
        match self {
            LimitScope::Namespace => "Namespace",
            LimitScope::Cluster => "Cluster",
        }
    }
}

/// Audit settings shared by every reconcile cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    /// How often a fresh report is re-audited
    pub scan_interval: Duration,
    /// Maximum audits running at once per scope
    pub max_concurrent_audits: usize,
    /// Registered plugin name
    pub plugin: String,
    /// Namespaces to audit; empty means all
    pub target_namespaces: Vec<String>,
    /// Admission limiting domain
    pub limit_scope: LimitScope,
    /// Kinds at which owner traversal stops
    pub top_level_kinds: Vec<String>,
    /// Upper bound for one reconcile cycle
    pub audit_timeout: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(24 * 60 * 60),
            max_concurrent_audits: 10,
            plugin: crate::plugin::hardening::NAME.to_string(),
            target_namespaces: Vec::new(),
            limit_scope: LimitScope::Namespace,
            top_level_kinds: ["Deployment", "StatefulSet", "DaemonSet", "CronJob"]
                .iter()
                .map(|k| (*k).to_string())
                .collect(),
            audit_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl AuditConfig {
    /// Parse config map data. Absent keys keep their default; present keys must be valid.
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        if let Some(unknown) = data.keys().find(|k| !KNOWN_KEYS.contains(&k.as_str())) {
            return Err(ConfigError::UnknownKey(unknown.clone()));
        }

        let mut config = Self::default();

        if let Some(value) = data.get(KEY_SCAN_INTERVAL) {
            config.scan_interval = parse_duration(KEY_SCAN_INTERVAL, value)?;
        }
        if let Some(value) = data.get(KEY_MAX_CONCURRENT_AUDITS) {
            config.max_concurrent_audits = match value.trim().parse::<usize>() {
                Ok(0) => return Err(ConfigError::invalid(KEY_MAX_CONCURRENT_AUDITS, value, "must be at least 1")),
                Ok(n) => n,
                Err(e) => return Err(ConfigError::invalid(KEY_MAX_CONCURRENT_AUDITS, value, e.to_string())),
            };
        }
        if let Some(value) = data.get(KEY_PLUGIN) {
            let name = value.trim();
            if !is_dns_label(name) {
                return Err(ConfigError::invalid(KEY_PLUGIN, value, "must be a lowercase DNS label"));
            }
            config.plugin = name.to_string();
        }
        if let Some(value) = data.get(KEY_TARGET_NAMESPACES) {
            config.target_namespaces = parse_list(value);
            if let Some(bad) = config.target_namespaces.iter().find(|ns| !is_dns_label(ns)) {
                return Err(ConfigError::invalid(
                    KEY_TARGET_NAMESPACES,
                    value,
                    format!("{bad:?} is not a valid namespace name"),
                ));
            }
        }
        if let Some(value) = data.get(KEY_LIMIT_SCOPE) {
            config.limit_scope = match value.trim() {
                "Namespace" => LimitScope::Namespace,
                "Cluster" => LimitScope::Cluster,
                _ => return Err(ConfigError::invalid(KEY_LIMIT_SCOPE, value, "expected Namespace or Cluster")),
            };
        }
        if let Some(value) = data.get(KEY_TOP_LEVEL_KINDS) {
            config.top_level_kinds = parse_list(value);
        }
        if let Some(value) = data.get(KEY_AUDIT_TIMEOUT) {
            config.audit_timeout = parse_duration(KEY_AUDIT_TIMEOUT, value)?;
        }

        Ok(config)
    }

    /// Serialize into config map data (used when creating the default object)
    pub fn to_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (KEY_SCAN_INTERVAL.to_string(), format_duration(self.scan_interval)),
            (KEY_MAX_CONCURRENT_AUDITS.to_string(), self.max_concurrent_audits.to_string()),
            (KEY_PLUGIN.to_string(), self.plugin.clone()),
            (KEY_TARGET_NAMESPACES.to_string(), self.target_namespaces.join(",")),
            (KEY_LIMIT_SCOPE.to_string(), self.limit_scope.as_str().to_string()),
            (KEY_TOP_LEVEL_KINDS.to_string(), self.top_level_kinds.join(",")),
            (KEY_AUDIT_TIMEOUT.to_string(), format_duration(self.audit_timeout)),
        ])
    }

    /// True when objects in `namespace` should be audited
    pub fn in_scope(&self, namespace: Option<&str>) -> bool {
        match namespace {
            _ if self.target_namespaces.is_empty() => true,
            Some(ns) => self.target_namespaces.iter().any(|t| t == ns),
            None => false,
        }
    }

    /// Admission limiter scope key for a subject
    pub fn scope_key(&self, subject: &ResourceRef) -> String {
        match self.limit_scope {
            LimitScope::Namespace => subject
                .namespace
                .clone()
                .unwrap_or_else(|| CLUSTER_SCOPE.to_string()),
            LimitScope::Cluster => CLUSTER_SCOPE.to_string(),
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

/// Parse durations such as `30s`, `5m`, `24h` or `1h30m`
pub fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::invalid(key, value, "empty duration"));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let multiplier = match ch {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            _ => return Err(ConfigError::invalid(key, value, format!("unexpected unit {ch:?}"))),
        };
        let amount: u64 = digits
            .parse()
            .map_err(|_| ConfigError::invalid(key, value, "missing number before unit"))?;
        total = total.saturating_add(amount.saturating_mul(multiplier));
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(ConfigError::invalid(key, value, "missing unit (s, m or h)"));
    }
    if total == 0 {
        return Err(ConfigError::invalid(key, value, "must be greater than zero"));
    }
    Ok(Duration::from_secs(total))
}

fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds % 3600 == 0 {
        format!("{}h", seconds / 3600)
    } else if seconds % 60 == 0 {
        format!("{}m", seconds / 60)
    } else {
        format!("{seconds}s")
    }
}

/// Bootstrap settings read from the process environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSettings {
    /// Namespace holding the config object
    pub namespace: String,
    /// Name of the config object
    pub config_name: String,
    /// Listen address for `/healthz` and `/readyz`
    pub health_addr: SocketAddr,
    /// Concurrent reconciles per watched kind
    pub worker_concurrency: u16,
}

impl OperatorSettings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from any key lookup (environment in production, a map in tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let namespace = lookup("OPERATOR_NAMESPACE").unwrap_or_else(|| DEFAULT_OPERATOR_NAMESPACE.to_string());
        let config_name = lookup("AUDIT_CONFIG_NAME").unwrap_or_else(|| DEFAULT_CONFIG_NAME.to_string());

        let health_addr = match lookup("HEALTH_PROBE_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|e: std::net::AddrParseError| ConfigError::invalid("HEALTH_PROBE_ADDR", &raw, e.to_string()))?,
            None => SocketAddr::from(([0, 0, 0, 0], 8081)),
        };

        let worker_concurrency = match lookup("WORKER_CONCURRENCY") {
            Some(raw) => match raw.parse::<u16>() {
                Ok(0) => return Err(ConfigError::invalid("WORKER_CONCURRENCY", &raw, "must be at least 1")),
                Ok(n) => n,
                Err(e) => return Err(ConfigError::invalid("WORKER_CONCURRENCY", &raw, e.to_string())),
            },
            None => 3,
        };

        Ok(Self {
            namespace,
            config_name,
            health_addr,
            worker_concurrency,
        })
    }
}

/// Reads and initialises the operator config object
pub struct ConfigManager {
    client: Arc<dyn ClusterClientTrait>,
    namespace: String,
    name: String,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ConfigManager {
    /// Creates a manager for the config object `namespace/name`.
    pub fn new(client: Arc<dyn ClusterClientTrait>, namespace: &str, name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Create the config object with default values if it does not exist
    pub async fn ensure_default(&self) -> Result<(), ConfigError> {
        match self.client.get_config_map(&self.namespace, &self.name).await {
            Ok(_) => {
                debug!("Config object {}/{} already exists", self.namespace, self.name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!("Creating default config object {}/{}", self.namespace, self.name);
                let config_map = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..ObjectMeta::default()
                    },
                    data: Some(AuditConfig::default().to_data()),
                    ..ConfigMap::default()
                };
                match self.client.create_config_map(&config_map).await {
                    Ok(_) => Ok(()),
                    // Another replica created it first
                    Err(ClusterError::AlreadyExists(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse the config object
    pub async fn read(&self) -> Result<AuditConfig, ConfigError> {
        let config_map = self.client.get_config_map(&self.namespace, &self.name).await?;
        let config = AuditConfig::from_data(&config_map.data.unwrap_or_default())?;
        info!(
            plugin = %config.plugin,
            max_concurrent_audits = config.max_concurrent_audits,
            scan_interval_secs = config.scan_interval.as_secs(),
            "Loaded audit configuration from {}/{}",
            self.namespace,
            self.name
        );
        Ok(config)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
