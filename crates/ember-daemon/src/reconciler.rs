use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use ember_common::{
    ActionKind, ContainerRuntime, ControlPlane, DaemonError, HandleUpdate, PendingAction,
    ServerRecord, ServerStatus, WorkloadSpec, WorkloadState,
};

use crate::backup::BackupExecutor;

/// Bounded wait for a workload to shut down cleanly before the engine
/// force-kills it.
pub const STOP_GRACE: Duration = Duration::from_secs(30);

/// Cache update produced by applying an action or correcting drift. The
/// daemon loop folds this into its in-memory record so later work in the
/// same cycle sees fresh state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPatch {
    pub status: ServerStatus,
    pub handle: HandleUpdate,
}

/// Turns a desired server record plus one pending action into a runtime
/// mutation and a status write-back. Handlers are idempotent: actions are
/// delivered at-least-once, and a crash between applying effects and
/// completing the action redelivers it.
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    control: Arc<dyn ControlPlane>,
    backup: Arc<BackupExecutor>,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        control: Arc<dyn ControlPlane>,
        backup: Arc<BackupExecutor>,
    ) -> Self {
        Self {
            runtime,
            control,
            backup,
        }
    }

    /// Apply one action. Every branch reports the new status (and handle, if
    /// changed) before returning; the caller completes the action only on
    /// `Ok` or `Validation`, so transient failures are redelivered next
    /// cycle.
    #[instrument(skip(self, action, record), fields(server_id = record.id, action_id = action.id, kind = %action.action))]
    pub async fn apply(
        &self,
        action: &PendingAction,
        record: &ServerRecord,
    ) -> Result<ServerPatch, DaemonError> {
        match action.action {
            ActionKind::Start => self.start(record).await,
            ActionKind::Stop => self.stop(record).await,
            ActionKind::Restart => self.restart(record).await,
            ActionKind::Backup => self.backup(record).await,
            ActionKind::Unknown => Err(DaemonError::Validation(format!(
                "unknown action kind for server {}",
                record.id
            ))),
        }
    }

    async fn start(&self, record: &ServerRecord) -> Result<ServerPatch, DaemonError> {
        if let Some(handle) = &record.container_id {
            match self.runtime.inspect(handle).await {
                Ok(info) if info.state == WorkloadState::Running => {
                    info!(%handle, "workload already running");
                    self.control
                        .report_status(record.id, ServerStatus::Running, HandleUpdate::Unchanged)
                        .await?;
                    return Ok(ServerPatch {
                        status: ServerStatus::Running,
                        handle: HandleUpdate::Unchanged,
                    });
                }
                Ok(_) => {
                    info!(%handle, "starting existing workload");
                    self.runtime.start(handle).await?;
                    self.control
                        .report_status(record.id, ServerStatus::Running, HandleUpdate::Unchanged)
                        .await?;
                    return Ok(ServerPatch {
                        status: ServerStatus::Running,
                        handle: HandleUpdate::Unchanged,
                    });
                }
                Err(e) if e.is_not_found() => {
                    info!(%handle, "workload gone, creating a new one");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let spec = WorkloadSpec::for_server(record);
        match self.runtime.create(&spec).await {
            Ok(handle) => {
                info!(%handle, "created workload");
                self.control
                    .report_status(
                        record.id,
                        ServerStatus::Running,
                        HandleUpdate::Set(handle.clone()),
                    )
                    .await?;
                Ok(ServerPatch {
                    status: ServerStatus::Running,
                    handle: HandleUpdate::Set(handle),
                })
            }
            Err(e) => {
                warn!(error = %e, "workload creation failed");
                // Surface the failure; the uncompleted action retries next
                // cycle, so the error status is best-effort.
                if let Err(report_err) = self
                    .control
                    .report_status(record.id, ServerStatus::Error, HandleUpdate::Unchanged)
                    .await
                {
                    warn!(error = %report_err, "could not report error status");
                }
                Err(e.into())
            }
        }
    }

    async fn stop(&self, record: &ServerRecord) -> Result<ServerPatch, DaemonError> {
        let Some(handle) = &record.container_id else {
            // Nothing to do, but the desired state is still observable.
            self.control
                .report_status(record.id, ServerStatus::Stopped, HandleUpdate::Unchanged)
                .await?;
            return Ok(ServerPatch {
                status: ServerStatus::Stopped,
                handle: HandleUpdate::Unchanged,
            });
        };

        match self.runtime.inspect(handle).await {
            Ok(info) if info.state == WorkloadState::Running => {
                info!(%handle, "stopping workload");
                self.runtime.stop(handle, STOP_GRACE).await?;
            }
            Ok(_) => info!(%handle, "workload already stopped"),
            Err(e) if e.is_not_found() => {
                warn!(%handle, "workload gone while stopping");
                self.control
                    .report_status(record.id, ServerStatus::Stopped, HandleUpdate::Clear)
                    .await?;
                return Ok(ServerPatch {
                    status: ServerStatus::Stopped,
                    handle: HandleUpdate::Clear,
                });
            }
            Err(e) => return Err(e.into()),
        }

        // The handle is kept: the next start reuses this container instead
        // of recreating it.
        self.control
            .report_status(record.id, ServerStatus::Stopped, HandleUpdate::Unchanged)
            .await?;
        Ok(ServerPatch {
            status: ServerStatus::Stopped,
            handle: HandleUpdate::Unchanged,
        })
    }

    async fn restart(&self, record: &ServerRecord) -> Result<ServerPatch, DaemonError> {
        let Some(handle) = &record.container_id else {
            info!("no workload handle, treating restart as start");
            return self.start(record).await;
        };

        match self.runtime.restart(handle, STOP_GRACE).await {
            Ok(()) => {
                info!(%handle, "restarted workload");
                self.control
                    .report_status(record.id, ServerStatus::Running, HandleUpdate::Unchanged)
                    .await?;
                Ok(ServerPatch {
                    status: ServerStatus::Running,
                    handle: HandleUpdate::Unchanged,
                })
            }
            Err(e) if e.is_not_found() => {
                warn!(%handle, "workload gone, starting a new one");
                self.start(record).await
            }
            Err(e) => {
                warn!(error = %e, %handle, "restart failed");
                if let Err(report_err) = self
                    .control
                    .report_status(record.id, ServerStatus::Error, HandleUpdate::Unchanged)
                    .await
                {
                    warn!(error = %report_err, "could not report error status");
                }
                Err(e.into())
            }
        }
    }

    async fn backup(&self, record: &ServerRecord) -> Result<ServerPatch, DaemonError> {
        let Some(handle) = &record.container_id else {
            return Err(DaemonError::Validation(format!(
                "no active workload for server {}",
                record.id
            )));
        };

        let info = match self.runtime.inspect(handle).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                return Err(DaemonError::Validation(format!(
                    "no active workload for server {}",
                    record.id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if info.state != WorkloadState::Running {
            return Err(DaemonError::Validation(format!(
                "no active workload for server {}",
                record.id
            )));
        }

        self.backup.create(record, &info).await?;
        // A backup changes no lifecycle state.
        Ok(ServerPatch {
            status: record.status,
            handle: HandleUpdate::Unchanged,
        })
    }
}
