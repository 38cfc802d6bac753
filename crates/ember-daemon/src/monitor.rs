use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use ember_common::{
    ContainerRuntime, ControlPlane, HandleUpdate, ServerId, ServerRecord, ServerStatus,
    StatsSnapshot, WorkloadState,
};

use crate::reconciler::ServerPatch;

/// Samples every server believed to be running and detects drift between
/// the cached status and the engine's view. Recovery is never attempted
/// here: a vanished workload becomes `error` and waits for the next `start`
/// action, keeping responsibility single-directional.
pub struct Monitor {
    runtime: Arc<dyn ContainerRuntime>,
    control: Arc<dyn ControlPlane>,
}

impl Monitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, control: Arc<dyn ControlPlane>) -> Self {
        Self { runtime, control }
    }

    /// One pass over the cached records. Returns cache patches for observed
    /// drift; `publish_stats` gates the per-server stats write-back to the
    /// stats cadence while drift detection runs every cycle.
    pub async fn run_once<'a>(
        &self,
        servers: impl Iterator<Item = &'a ServerRecord>,
        publish_stats: bool,
    ) -> Vec<(ServerId, ServerPatch)> {
        let mut patches = Vec::new();

        for record in servers {
            if record.status != ServerStatus::Running {
                continue;
            }
            let Some(handle) = &record.container_id else {
                continue;
            };

            match self.runtime.inspect(handle).await {
                Ok(info) if info.state == WorkloadState::Running => {
                    if publish_stats {
                        self.publish(record, handle, info.started_at).await;
                    }
                }
                Ok(info) => {
                    // Unexpectedly not running: report the observed state
                    // verbatim and let the control plane decide.
                    let status = ServerStatus::from(info.state);
                    warn!(
                        server_id = record.id,
                        %handle,
                        %status,
                        "workload drifted out of running state"
                    );
                    if let Err(e) = self
                        .control
                        .report_status(record.id, status, HandleUpdate::Unchanged)
                        .await
                    {
                        warn!(server_id = record.id, error = %e, "status report failed");
                    }
                    patches.push((
                        record.id,
                        ServerPatch {
                            status,
                            handle: HandleUpdate::Unchanged,
                        },
                    ));
                }
                Err(e) if e.is_not_found() => {
                    warn!(server_id = record.id, %handle, "workload not found");
                    if let Err(e) = self
                        .control
                        .report_status(record.id, ServerStatus::Error, HandleUpdate::Clear)
                        .await
                    {
                        warn!(server_id = record.id, error = %e, "status report failed");
                    }
                    patches.push((
                        record.id,
                        ServerPatch {
                            status: ServerStatus::Error,
                            handle: HandleUpdate::Clear,
                        },
                    ));
                }
                Err(e) => {
                    // Transient; resampled next cycle.
                    warn!(server_id = record.id, %handle, error = %e, "inspect failed");
                }
            }
        }

        patches
    }

    async fn publish(
        &self,
        record: &ServerRecord,
        handle: &str,
        started_at: Option<chrono::DateTime<Utc>>,
    ) {
        let raw = match self.runtime.stats(handle).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(server_id = record.id, %handle, error = %e, "stats sample failed");
                return;
            }
        };

        let uptime_secs = started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0);
        let snapshot = StatsSnapshot {
            cpu_percent: raw.cpu_percent(),
            memory_bytes: raw.memory_usage_bytes,
            uptime_secs,
        };

        debug!(
            server_id = record.id,
            cpu = snapshot.cpu_percent,
            memory = snapshot.memory_bytes,
            "publishing stats"
        );
        if let Err(e) = self.control.report_stats(record.id, &snapshot).await {
            warn!(server_id = record.id, error = %e, "stats report failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{running_server, FakeControlPlane, FakeRuntime};
    use ember_common::RawStats;

    #[tokio::test]
    async fn missing_workload_flips_status_to_error_and_clears_handle() {
        let runtime = Arc::new(FakeRuntime::new());
        let control = Arc::new(FakeControlPlane::new());
        let record = running_server(1, "vanished");
        control.put_server(record.clone());
        let monitor = Monitor::new(runtime, control.clone());

        let patches = monitor.run_once([&record].into_iter(), false).await;

        assert_eq!(
            patches,
            vec![(
                1,
                ServerPatch {
                    status: ServerStatus::Error,
                    handle: HandleUpdate::Clear,
                }
            )]
        );
        let stored = control.server(1).unwrap();
        assert_eq!(stored.status, ServerStatus::Error);
        assert_eq!(stored.container_id, None);
    }

    #[tokio::test]
    async fn non_running_state_is_reported_verbatim_with_handle_kept() {
        let runtime = Arc::new(FakeRuntime::new());
        let control = Arc::new(FakeControlPlane::new());
        let handle = runtime.seed_workload("ember-server-1", WorkloadState::Paused);
        let record = running_server(1, &handle);
        control.put_server(record.clone());
        let monitor = Monitor::new(runtime, control.clone());

        let patches = monitor.run_once([&record].into_iter(), false).await;

        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].1.status, ServerStatus::Paused);
        assert_eq!(patches[0].1.handle, HandleUpdate::Unchanged);
        let stored = control.server(1).unwrap();
        assert_eq!(stored.status, ServerStatus::Paused);
        assert_eq!(stored.container_id.as_deref(), Some(handle.as_str()));
    }

    #[tokio::test]
    async fn running_workload_publishes_derived_stats() {
        let runtime = Arc::new(FakeRuntime::new());
        let control = Arc::new(FakeControlPlane::new());
        let handle = runtime.seed_workload("ember-server-1", WorkloadState::Running);
        runtime.set_raw_stats(
            &handle,
            RawStats {
                cpu_total_usage: 300_000,
                precpu_total_usage: 100_000,
                system_cpu_usage: Some(2_000_000),
                presystem_cpu_usage: Some(1_000_000),
                memory_usage_bytes: 512 * 1024 * 1024,
            },
        );
        let record = running_server(1, &handle);
        control.put_server(record.clone());
        let monitor = Monitor::new(runtime, control.clone());

        let patches = monitor.run_once([&record].into_iter(), true).await;
        assert!(patches.is_empty());

        let stats = control.reported_stats();
        assert_eq!(stats.len(), 1);
        let (server_id, snapshot) = &stats[0];
        assert_eq!(*server_id, 1);
        assert_eq!(snapshot.cpu_percent, 20.0);
        assert_eq!(snapshot.memory_bytes, 512 * 1024 * 1024);
    }

    #[tokio::test]
    async fn stats_are_not_published_outside_the_stats_cadence() {
        let runtime = Arc::new(FakeRuntime::new());
        let control = Arc::new(FakeControlPlane::new());
        let handle = runtime.seed_workload("ember-server-1", WorkloadState::Running);
        let record = running_server(1, &handle);
        control.put_server(record.clone());
        let monitor = Monitor::new(runtime, control.clone());

        let patches = monitor.run_once([&record].into_iter(), false).await;
        assert!(patches.is_empty());
        assert!(control.reported_stats().is_empty());
    }
}
