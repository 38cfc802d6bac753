use std::time::Duration;

use async_trait::async_trait;

use crate::model::{
    ActionId, BackupArtifact, HandleUpdate, PendingAction, RawStats, ServerId, ServerRecord,
    ServerStatus, StatsSnapshot, SystemStats, WorkloadInfo, WorkloadSpec,
};
use crate::{ControlPlaneError, RuntimeError};

/// Capability for talking to the panel's control plane. The daemon consumes
/// desired state through this and writes observed state back; every call is
/// a network round-trip that may fail transiently.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn fetch_servers(&self) -> Result<Vec<ServerRecord>, ControlPlaneError>;

    async fn fetch_pending_actions(&self) -> Result<Vec<PendingAction>, ControlPlaneError>;

    async fn report_status(
        &self,
        server_id: ServerId,
        status: ServerStatus,
        handle: HandleUpdate,
    ) -> Result<(), ControlPlaneError>;

    async fn report_stats(
        &self,
        server_id: ServerId,
        stats: &StatsSnapshot,
    ) -> Result<(), ControlPlaneError>;

    async fn report_system_stats(&self, stats: &SystemStats) -> Result<(), ControlPlaneError>;

    async fn register_backup(
        &self,
        server_id: ServerId,
        artifact: &BackupArtifact,
    ) -> Result<(), ControlPlaneError>;

    /// Acknowledge an action. Called only after its effects are applied and
    /// reported, which is what makes delivery at-least-once.
    async fn complete_action(&self, action_id: ActionId) -> Result<(), ControlPlaneError>;
}

/// Host-wide resource sampling for the periodic system stats report.
#[async_trait]
pub trait SystemSampler: Send + Sync {
    async fn sample(&self) -> SystemStats;
}

/// Capability wrapping the host container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a workload and return its handle. The workload is started as
    /// part of creation.
    async fn create(&self, spec: &WorkloadSpec) -> Result<String, RuntimeError>;

    async fn start(&self, handle: &str) -> Result<(), RuntimeError>;

    /// Graceful stop; the engine force-kills after `grace`.
    async fn stop(&self, handle: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn restart(&self, handle: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// `RuntimeError::NotFound` when the handle no longer resolves.
    async fn inspect(&self, handle: &str) -> Result<WorkloadInfo, RuntimeError>;

    /// One point-in-time sample carrying both "now" and "pre" counters.
    async fn stats(&self, handle: &str) -> Result<RawStats, RuntimeError>;

    /// All workloads carrying the daemon-owned marker label, in any state.
    async fn list_managed(&self) -> Result<Vec<WorkloadInfo>, RuntimeError>;

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError>;
}
