//! Built-in `workload-hardening` plugin
//!
//! Reads the subject's pod template and evaluates a fixed set of security
//! and resource checks against it. Each check yields a pass or fail with a
//! severity; the payload carries the per-check results and a summary.

use super::{AuditPlugin, AuditResult, Evidence, PluginError};
use crate::owner::OwnerChain;
use async_trait::async_trait;
use cluster_client::LogOptions;
use crds::ResourceRef;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Registered plugin name
pub const NAME: &str = "workload-hardening";
/// Plugin version recorded in reports
pub const VERSION: &str = "0.1.0";

/// Log lines scanned per container of a Pod subject
const LOG_TAIL_LINES: i64 = 500;
const LOG_LIMIT_BYTES: i64 = 256 * 1024;

/// Substrings that indicate a credential was written to a log
const CREDENTIAL_MARKERS: [&str; 5] = [
    "-----begin rsa private key-----",
    "-----begin private key-----",
    "aws_secret_access_key",
    "password=",
    "authorization: bearer ",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Severity {
    Warning,
    Danger,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckResult {
    check_id: &'static str,
    severity: Severity,
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    container: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    pass_count: usize,
    warning_count: usize,
    danger_count: usize,
}

#[derive(Debug, Serialize)]
struct Payload {
    summary: Summary,
    checks: Vec<CheckResult>,
}

/// JSON pointer to the pod spec inside an object of `kind`
fn pod_spec_pointer(kind: &str) -> Option<&'static str> {
    match kind {
        "Pod" => Some("/spec"),
        "CronJob" => Some("/spec/jobTemplate/spec/template/spec"),
        "Deployment" | "ReplicaSet" | "StatefulSet" | "DaemonSet" | "Job" | "ReplicationController" => {
            Some("/spec/template/spec")
        }
        _ => None,
    }
}

fn flag(value: &Value, pointer: &str) -> Option<bool> {
    value.pointer(pointer).and_then(Value::as_bool)
}

fn check(check_id: &'static str, severity: Severity, success: bool, message: String, container: Option<&str>) -> CheckResult {
    CheckResult {
        check_id,
        severity,
        success,
        message,
        container: container.map(str::to_string),
    }
}

/// Image uses `latest` or no tag at all (digests are pinned)
fn image_unpinned(image: &str) -> bool {
    if image.contains('@') {
        return false;
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.split_once(':') {
        Some((_, tag)) => tag == "latest",
        None => true,
    }
}

fn evaluate(pod_spec: &Value) -> Vec<CheckResult> {
    let mut checks = Vec::new();

    for (field, check_id) in [
        ("/hostNetwork", "hostNetworkSet"),
        ("/hostPID", "hostPIDSet"),
        ("/hostIPC", "hostIPCSet"),
    ] {
        let enabled = flag(pod_spec, field).unwrap_or(false);
        checks.push(check(
            check_id,
            Severity::Danger,
            !enabled,
            format!("{} should not be enabled", &field[1..]),
            None,
        ));
    }

    let pod_non_root = flag(pod_spec, "/securityContext/runAsNonRoot").unwrap_or(false);

    let containers = ["containers", "initContainers"]
        .into_iter()
        .filter_map(|key| pod_spec.get(key).and_then(Value::as_array))
        .flatten();

    for container in containers {
        let name = container.get("name").and_then(Value::as_str).unwrap_or("<unnamed>");
        let security = container.get("securityContext").cloned().unwrap_or(Value::Null);

        checks.push(check(
            "privilegedContainer",
            Severity::Danger,
            !flag(&security, "/privileged").unwrap_or(false),
            "container should not run privileged".to_string(),
            Some(name),
        ));
        checks.push(check(
            "privilegeEscalationAllowed",
            Severity::Warning,
            flag(&security, "/allowPrivilegeEscalation") == Some(false),
            "allowPrivilegeEscalation should be set to false".to_string(),
            Some(name),
        ));
        checks.push(check(
            "runAsRootAllowed",
            Severity::Warning,
            flag(&security, "/runAsNonRoot").unwrap_or(pod_non_root),
            "container should set runAsNonRoot".to_string(),
            Some(name),
        ));
        checks.push(check(
            "notReadOnlyRootFilesystem",
            Severity::Warning,
            flag(&security, "/readOnlyRootFilesystem").unwrap_or(false),
            "root filesystem should be read-only".to_string(),
            Some(name),
        ));
        for resource in ["cpu", "memory"] {
            let has_limit = container
                .pointer(&format!("/resources/limits/{resource}"))
                .is_some();
            checks.push(check(
                if resource == "cpu" { "cpuLimitsMissing" } else { "memoryLimitsMissing" },
                Severity::Warning,
                has_limit,
                format!("{resource} limits should be set"),
                Some(name),
            ));
        }
        let image = container.get("image").and_then(Value::as_str).unwrap_or_default();
        checks.push(check(
            "tagNotSpecified",
            Severity::Danger,
            !image_unpinned(image),
            format!("image {image:?} should use a specific tag or digest"),
            Some(name),
        ));
    }

    checks
}

fn contains_credentials(logs: &[u8]) -> bool {
    let text = String::from_utf8_lossy(logs).to_lowercase();
    CREDENTIAL_MARKERS.iter().any(|marker| text.contains(marker))
}

fn container_names(pod_spec: &Value) -> Vec<&str> {
    pod_spec
        .get("containers")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|container| container.get("name").and_then(Value::as_str))
        .collect()
}

/// Scan recent container logs of a Pod subject for leaked credentials
async fn scan_logs(pod_spec: &Value, evidence: &Evidence<'_>) -> Result<Vec<CheckResult>, PluginError> {
    let mut checks = Vec::new();
    for name in container_names(pod_spec) {
        let options = LogOptions {
            tail_lines: Some(LOG_TAIL_LINES),
            limit_bytes: Some(LOG_LIMIT_BYTES),
            ..LogOptions::for_container(name)
        };
        // Containers that have not started yet have nothing to scan
        let Some(logs) = evidence.logs(&options).await? else {
            continue;
        };
        checks.push(check(
            "credentialsInLogs",
            Severity::Danger,
            !contains_credentials(&logs),
            "container logs should not contain credentials".to_string(),
            Some(name),
        ));
    }
    Ok(checks)
}

fn summarize(checks: &[CheckResult]) -> Summary {
    checks.iter().fold(Summary::default(), |mut summary, c| {
        match (c.success, c.severity) {
            (true, _) => summary.pass_count += 1,
            (false, Severity::Warning) => summary.warning_count += 1,
            (false, Severity::Danger) => summary.danger_count += 1,
        }
        summary
    })
}

/// Pod security and resource hygiene checks
#[derive(Debug, Default)]
pub struct WorkloadHardeningPlugin;

impl WorkloadHardeningPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditPlugin for WorkloadHardeningPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        VERSION
    }

    async fn audit(
        &self,
        subject: &ResourceRef,
        chain: &OwnerChain,
        evidence: &Evidence<'_>,
    ) -> Result<AuditResult, PluginError> {
        let pointer = pod_spec_pointer(&subject.kind)
            .ok_or_else(|| PluginError::Permanent(format!("kind {} has no pod template", subject.kind)))?;

        let object = evidence.object(subject).await?;
        let pod_spec = object
            .data
            .pointer(pointer)
            .ok_or_else(|| PluginError::Permanent(format!("{subject} has no pod spec at {pointer}")))?;

        let mut checks = evaluate(pod_spec);
        if chain.pod().is_some() {
            checks.extend(scan_logs(pod_spec, evidence).await?);
        }
        let summary = summarize(&checks);
        debug!(
            passed = summary.pass_count,
            warnings = summary.warning_count,
            dangers = summary.danger_count,
            "Audited {}",
            subject
        );

        let payload = serde_json::to_value(Payload { summary, checks })
            .map_err(|e| PluginError::Permanent(format!("failed to encode payload: {e}")))?;
        Ok(AuditResult {
            payload,
            plugin_version: VERSION.to_string(),
        })
    }
}
