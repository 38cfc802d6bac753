use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use ember_common::{
    ContainerRuntime, ControlPlane, DaemonError, HandleUpdate, PendingAction, ServerId,
    ServerRecord, ServerStatus, SystemSampler, WorkloadState,
};

use crate::backup::BackupExecutor;
use crate::config::DaemonConfig;
use crate::monitor::Monitor;
use crate::reaper::OrphanReaper;
use crate::reconciler::{Reconciler, ServerPatch};

/// The top-level scheduler: one cooperative loop composing cache refresh,
/// action reconciliation, monitoring, stats publication, scheduled backups
/// and orphan reaping, each on its own cadence. Single-threaded at the
/// scheduling level, so the server cache has exactly one writer and actions
/// for a server never overlap.
pub struct Daemon {
    config: DaemonConfig,
    control: Arc<dyn ControlPlane>,
    runtime: Arc<dyn ContainerRuntime>,
    sampler: Arc<dyn SystemSampler>,
    reconciler: Reconciler,
    monitor: Monitor,
    reaper: OrphanReaper,
    backup: Arc<BackupExecutor>,
    cache: HashMap<ServerId, ServerRecord>,
    last_stats: Option<Instant>,
    last_backup: Option<Instant>,
    last_reap: Option<Instant>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        runtime: Arc<dyn ContainerRuntime>,
        control: Arc<dyn ControlPlane>,
        sampler: Arc<dyn SystemSampler>,
    ) -> Self {
        let backup = Arc::new(BackupExecutor::new(
            control.clone(),
            config.backup_dir.clone(),
            config.volumes_root.clone(),
        ));
        Self {
            reconciler: Reconciler::new(runtime.clone(), control.clone(), backup.clone()),
            monitor: Monitor::new(runtime.clone(), control.clone()),
            reaper: OrphanReaper::new(runtime.clone()),
            backup,
            config,
            control,
            runtime,
            sampler,
            cache: HashMap::new(),
            last_stats: None,
            last_backup: None,
            last_reap: None,
        }
    }

    /// Run until the shutdown flag flips. The in-flight cycle always
    /// finishes; there is no mid-action abort.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            "daemon loop started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("shutdown signal observed, daemon loop exiting");
    }

    /// One full reconciliation cycle. Public so tests can drive the daemon
    /// deterministically.
    #[instrument(skip(self))]
    pub async fn run_cycle(&mut self) {
        match self.control.fetch_servers().await {
            Ok(servers) => {
                self.cache = servers.into_iter().map(|s| (s.id, s)).collect();
            }
            Err(e) => {
                error!(error = %e, "server cache refresh failed, skipping cycle");
                return;
            }
        }

        match self.control.fetch_pending_actions().await {
            Ok(actions) => {
                for action in actions {
                    self.handle_action(action).await;
                }
            }
            Err(e) => error!(error = %e, "pending action fetch failed"),
        }

        let stats_due = due(self.last_stats, self.config.stats_interval_secs);
        let records: Vec<ServerRecord> = self.cache.values().cloned().collect();
        let patches = self.monitor.run_once(records.iter(), stats_due).await;
        for (server_id, patch) in patches {
            self.apply_patch(server_id, patch);
        }

        if stats_due {
            let stats = self.sampler.sample().await;
            if let Err(e) = self.control.report_system_stats(&stats).await {
                warn!(error = %e, "system stats report failed");
            }
            self.last_stats = Some(Instant::now());
        }

        if due(self.last_backup, self.config.backup_interval_secs) {
            self.scheduled_backups().await;
            self.last_backup = Some(Instant::now());
        }

        if due(self.last_reap, self.config.reap_interval_secs) {
            // Known set is snapshotted from the cache refreshed this cycle,
            // never reused across cycles.
            let known: HashSet<String> = self
                .cache
                .values()
                .filter_map(|s| s.container_id.clone())
                .collect();
            match self.reaper.run_once(&known).await {
                Ok(0) => {}
                Ok(reaped) => info!(reaped, "removed orphaned workloads"),
                Err(e) => warn!(error = %e, "orphan reaping failed"),
            }
            self.last_reap = Some(Instant::now());
        }
    }

    async fn handle_action(&mut self, action: PendingAction) {
        let Some(record) = self.cache.get(&action.server_id).cloned() else {
            warn!(
                action_id = action.id,
                server_id = action.server_id,
                "action targets a server the control plane no longer lists"
            );
            self.complete(action.id).await;
            return;
        };

        match self.reconciler.apply(&action, &record).await {
            Ok(patch) => {
                self.apply_patch(action.server_id, patch);
                self.complete(action.id).await;
            }
            Err(DaemonError::Validation(msg)) => {
                warn!(action_id = action.id, %msg, "action rejected");
                self.complete(action.id).await;
            }
            Err(e) => {
                // Not completed: the control plane redelivers it next cycle.
                error!(action_id = action.id, error = %e, "action failed, will retry");
            }
        }
    }

    async fn complete(&self, action_id: i64) {
        if let Err(e) = self.control.complete_action(action_id).await {
            error!(action_id, error = %e, "completion failed, action will be redelivered");
        }
    }

    fn apply_patch(&mut self, server_id: ServerId, patch: ServerPatch) {
        if let Some(record) = self.cache.get_mut(&server_id) {
            record.status = patch.status;
            match patch.handle {
                HandleUpdate::Unchanged => {}
                HandleUpdate::Set(handle) => record.container_id = Some(handle),
                HandleUpdate::Clear => record.container_id = None,
            }
        }
    }

    async fn scheduled_backups(&self) {
        for record in self.cache.values() {
            if record.status != ServerStatus::Running {
                continue;
            }
            let Some(handle) = &record.container_id else {
                continue;
            };
            let info = match self.runtime.inspect(handle).await {
                Ok(info) if info.state == WorkloadState::Running => info,
                Ok(_) | Err(_) => continue,
            };
            match self.backup.create(record, &info).await {
                Ok(_) => {}
                Err(DaemonError::Validation(msg)) => {
                    debug!(server_id = record.id, %msg, "scheduled backup skipped")
                }
                Err(e) => warn!(server_id = record.id, error = %e, "scheduled backup failed"),
            }
        }
    }
}

fn due(last: Option<Instant>, interval_secs: u64) -> bool {
    match last {
        None => true,
        Some(at) => at.elapsed() >= Duration::from_secs(interval_secs),
    }
}
