use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub type ServerId = i64;
pub type ActionId = i64;

/// Label every daemon-created container carries; the orphan reaper filters
/// on it when listing workloads.
pub const MANAGED_LABEL: &str = "io.emberpanel.managed";
/// Label holding the owning server id.
pub const SERVER_ID_LABEL: &str = "io.emberpanel.server-id";
/// Deterministic container name prefix, `<prefix><server_id>`.
pub const MANAGED_NAME_PREFIX: &str = "ember-server-";

/// A server as the control plane describes it. The daemon caches these per
/// cycle and is never authoritative for any field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub name: String,
    pub image: String,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub disk_limit_mb: u64,
    pub port: u16,
    #[serde(default)]
    pub variables: Vec<EnvVar>,
    pub status: ServerStatus,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// Observed server status as reported to the control plane. `created` and
/// `paused` exist so the monitor can report an unexpectedly non-running
/// workload's state verbatim instead of forcing it into `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
    Error,
    Created,
    Paused,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
            ServerStatus::Created => "created",
            ServerStatus::Paused => "paused",
        }
    }
}

impl Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operator request queued by the control plane, consumed at-most-once
/// per delivery. Redelivery after a crash is possible; handlers stay
/// idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: ActionId,
    pub server_id: ServerId,
    pub action: ActionKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Start,
    Stop,
    Restart,
    Backup,
    /// Anything the wire carries that this daemon does not understand.
    #[serde(other)]
    Unknown,
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::Start => "start",
            ActionKind::Stop => "stop",
            ActionKind::Restart => "restart",
            ActionKind::Backup => "backup",
            ActionKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Runtime-handle change attached to a status report. `Unchanged` keeps the
/// control plane's stored handle; `Clear` nulls it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleUpdate {
    Unchanged,
    Set(String),
    Clear,
}

/// The container engine's view of a workload lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    Created,
    Running,
    Paused,
    Stopped,
    Removed,
}

impl From<WorkloadState> for ServerStatus {
    fn from(state: WorkloadState) -> Self {
        match state {
            WorkloadState::Created => ServerStatus::Created,
            WorkloadState::Running => ServerStatus::Running,
            WorkloadState::Paused => ServerStatus::Paused,
            WorkloadState::Stopped => ServerStatus::Stopped,
            WorkloadState::Removed => ServerStatus::Error,
        }
    }
}

/// Inspect result for a single workload.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadInfo {
    pub id: String,
    pub name: String,
    pub state: WorkloadState,
    pub started_at: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Volume name on the engine side.
    pub name: String,
    /// Backing path on the host.
    pub source: String,
    /// Mount point inside the container.
    pub destination: String,
}

/// Everything needed to create a new workload for a server.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// Mapped identically on host and container.
    pub port: u16,
    pub memory_bytes: i64,
    /// CFS quota in microseconds per 100ms period.
    pub cpu_quota_us: i64,
    pub labels: Vec<(String, String)>,
}

impl WorkloadSpec {
    /// Build the creation spec for a server record: env from its variables,
    /// memory MB scaled to bytes, CPU cores scaled to a CFS quota, and the
    /// daemon marker labels plus a deterministic name for debuggability and
    /// orphan detection.
    pub fn for_server(record: &ServerRecord) -> Self {
        WorkloadSpec {
            name: format!("{MANAGED_NAME_PREFIX}{}", record.id),
            image: record.image.clone(),
            env: record
                .variables
                .iter()
                .map(|v| format!("{}={}", v.key, v.value))
                .collect(),
            port: record.port,
            memory_bytes: (record.memory_limit_mb as i64) << 20,
            cpu_quota_us: (record.cpu_limit * 100_000.0) as i64,
            labels: vec![
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (SERVER_ID_LABEL.to_string(), record.id.to_string()),
            ],
        }
    }
}

/// Two-point cumulative counter pair from a single stats call, plus the
/// instantaneous memory reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawStats {
    pub cpu_total_usage: u64,
    pub precpu_total_usage: u64,
    pub system_cpu_usage: Option<u64>,
    pub presystem_cpu_usage: Option<u64>,
    pub memory_usage_bytes: u64,
}

impl RawStats {
    /// CPU percentage over the sample window:
    /// `(Δcontainer_usage / Δhost_usage) × 100`, 0.0 when the host delta is
    /// missing or did not advance.
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self.cpu_total_usage.saturating_sub(self.precpu_total_usage);
        let system_delta = match (self.system_cpu_usage, self.presystem_cpu_usage) {
            (Some(now), Some(pre)) => now.saturating_sub(pre),
            _ => 0,
        };
        if system_delta == 0 {
            return 0.0;
        }
        cpu_delta as f64 / system_delta as f64 * 100.0
    }
}

/// Derived per-server metrics, recomputed every monitor cycle and never
/// stored locally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
}

/// Host-wide resource usage published on the stats cadence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_percent: f64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub disk_percent: f64,
}

/// A completed backup archive. Append-only; the control plane owns deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub server_id: ServerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ServerRecord {
        ServerRecord {
            id: 7,
            name: "mc-survival".to_string(),
            image: "mc:latest".to_string(),
            memory_limit_mb: 1024,
            cpu_limit: 1.5,
            disk_limit_mb: 10_240,
            port: 25565,
            variables: vec![EnvVar {
                key: "EULA".to_string(),
                value: "TRUE".to_string(),
            }],
            status: ServerStatus::Stopped,
            container_id: None,
            ip_address: None,
        }
    }

    #[test]
    fn workload_spec_scales_limits() {
        let spec = WorkloadSpec::for_server(&record());
        assert_eq!(spec.name, "ember-server-7");
        assert_eq!(spec.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(spec.cpu_quota_us, 150_000);
        assert_eq!(spec.env, vec!["EULA=TRUE".to_string()]);
        assert!(spec
            .labels
            .contains(&(MANAGED_LABEL.to_string(), "true".to_string())));
    }

    #[test]
    fn cpu_percent_from_counter_deltas() {
        let raw = RawStats {
            cpu_total_usage: 1_200_000,
            precpu_total_usage: 1_000_000,
            system_cpu_usage: Some(11_000_000),
            presystem_cpu_usage: Some(10_000_000),
            memory_usage_bytes: 0,
        };
        assert_eq!(raw.cpu_percent(), 20.0);
    }

    #[test]
    fn cpu_percent_zero_when_host_delta_missing() {
        let raw = RawStats {
            cpu_total_usage: 500,
            precpu_total_usage: 100,
            system_cpu_usage: None,
            presystem_cpu_usage: None,
            memory_usage_bytes: 0,
        };
        assert_eq!(raw.cpu_percent(), 0.0);
    }

    #[test]
    fn action_kind_tolerates_unknown_wire_values() {
        let action: PendingAction = serde_json::from_str(
            r#"{"id":1,"server_id":7,"action":"defragment","created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(action.action, ActionKind::Unknown);
    }

    #[test]
    fn server_status_wire_format_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&ServerStatus::Running).unwrap(),
            "\"running\""
        );
        let s: ServerStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(s, ServerStatus::Error);
    }
}
