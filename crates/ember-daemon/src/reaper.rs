use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use ember_common::{ContainerRuntime, DaemonError};

use crate::reconciler::STOP_GRACE;

/// Finds workloads carrying the daemon marker that the control plane does
/// not know about and terminates them. The known-handle set must be
/// snapshotted fresh from the just-refreshed cache on every run, never
/// carried across cycles, so a create whose registration is still in flight
/// is not reaped.
pub struct OrphanReaper {
    runtime: Arc<dyn ContainerRuntime>,
}

impl OrphanReaper {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Returns the number of orphans removed.
    #[instrument(skip(self, known), fields(known = known.len()))]
    pub async fn run_once(&self, known: &HashSet<String>) -> Result<usize, DaemonError> {
        let workloads = self.runtime.list_managed().await?;
        let mut reaped = 0;

        for workload in workloads {
            if known.contains(&workload.id) {
                continue;
            }
            warn!(handle = %workload.id, name = %workload.name, "reaping orphaned workload");

            // Best-effort graceful stop; removal is forced either way.
            if let Err(e) = self.runtime.stop(&workload.id, STOP_GRACE).await {
                if !e.is_not_found() {
                    debug!(handle = %workload.id, error = %e, "orphan stop failed");
                }
            }
            match self.runtime.remove(&workload.id).await {
                Ok(()) => reaped += 1,
                Err(e) if e.is_not_found() => reaped += 1,
                Err(e) => warn!(handle = %workload.id, error = %e, "orphan removal failed"),
            }
        }

        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeRuntime;
    use ember_common::WorkloadState;

    #[tokio::test]
    async fn reaps_exactly_the_unknown_workloads() {
        let runtime = Arc::new(FakeRuntime::new());
        let known_a = runtime.seed_workload("ember-server-1", WorkloadState::Running);
        let known_b = runtime.seed_workload("ember-server-2", WorkloadState::Stopped);
        runtime.seed_workload("ember-server-9", WorkloadState::Running);
        runtime.seed_workload("ember-server-10", WorkloadState::Running);

        let known: HashSet<String> = [known_a.clone(), known_b.clone()].into();
        let reaper = OrphanReaper::new(runtime.clone());

        let reaped = reaper.run_once(&known).await.unwrap();

        assert_eq!(reaped, 2);
        assert!(runtime.inspect_blocking(&known_a).is_some());
        assert!(runtime.inspect_blocking(&known_b).is_some());
        assert_eq!(runtime.workload_count(), 2);
    }

    #[tokio::test]
    async fn empty_known_set_reaps_everything_managed() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.seed_workload("ember-server-1", WorkloadState::Running);
        runtime.seed_workload("ember-server-2", WorkloadState::Running);

        let reaper = OrphanReaper::new(runtime.clone());
        let reaped = reaper.run_once(&HashSet::new()).await.unwrap();

        assert_eq!(reaped, 2);
        assert_eq!(runtime.workload_count(), 0);
    }

    #[tokio::test]
    async fn nothing_to_reap_when_all_workloads_are_known() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = runtime.seed_workload("ember-server-1", WorkloadState::Running);

        let reaper = OrphanReaper::new(runtime.clone());
        let reaped = reaper.run_once(&[handle].into()).await.unwrap();

        assert_eq!(reaped, 0);
        assert_eq!(runtime.workload_count(), 1);
    }
}
