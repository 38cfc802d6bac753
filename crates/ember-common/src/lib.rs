// Shared data model, error taxonomy and capability traits for the
// emberpanel daemon. Everything the daemon core needs to talk about lives
// here; the concrete Docker and HTTP clients live in their own crates.

use thiserror::Error;

pub mod model;
pub mod traits;

pub use model::{
    ActionId, ActionKind, BackupArtifact, EnvVar, HandleUpdate, PendingAction, RawStats,
    ServerId, ServerRecord, ServerStatus, StatsSnapshot, SystemStats, VolumeMount, WorkloadInfo,
    WorkloadSpec, WorkloadState, MANAGED_LABEL, MANAGED_NAME_PREFIX, SERVER_ID_LABEL,
};
pub use traits::{ContainerRuntime, ControlPlane, SystemSampler};

/// Errors from the control-plane client. All of these are Transient-I/O from
/// the daemon's point of view: logged, skipped, retried next cycle.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("control plane request failed: {0}")]
    Http(String),

    #[error("control plane returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("control plane response could not be decoded: {0}")]
    Decode(String),
}

/// Errors from the container runtime. `NotFound` is distinguished because it
/// is state-correcting rather than transient: call sites either clear the
/// handle or fall through to recreation.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("workload not found: {0}")]
    NotFound(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container runtime error: {0}")]
    Api(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Daemon-level error wrapping both capability errors plus the local
/// validation and backup failure classes.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
