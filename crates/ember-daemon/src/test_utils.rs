//! In-memory fakes for both daemon capabilities. Kept in the library so
//! unit tests and the integration suite share them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use ember_common::{
    ActionId, ActionKind, BackupArtifact, ContainerRuntime, ControlPlane, ControlPlaneError,
    EnvVar, HandleUpdate, PendingAction, RawStats, RuntimeError, ServerId, ServerRecord,
    ServerStatus, StatsSnapshot, SystemSampler, SystemStats, WorkloadInfo, WorkloadSpec,
    WorkloadState,
};

pub fn stopped_server(id: ServerId) -> ServerRecord {
    ServerRecord {
        id,
        name: format!("server-{id}"),
        image: "mc:latest".to_string(),
        memory_limit_mb: 1024,
        cpu_limit: 1.0,
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

pub fn running_server(id: ServerId, handle: &str) -> ServerRecord {
    ServerRecord {
        status: ServerStatus::Running,
        container_id: Some(handle.to_string()),
        ..stopped_server(id)
    }
}

pub fn action(id: ActionId, server_id: ServerId, kind: ActionKind) -> PendingAction {
    PendingAction {
        id,
        server_id,
        action: kind,
        created_at: Utc::now(),
    }
}

/// Container engine fake: a workload map plus per-operation counters and an
/// operation log for ordering assertions.
#[derive(Default)]
pub struct FakeRuntime {
    workloads: Mutex<HashMap<String, WorkloadInfo>>,
    raw_stats: Mutex<HashMap<String, RawStats>>,
    op_log: Mutex<Vec<String>>,
    next_handle: AtomicU64,
    creates: AtomicU64,
    starts: AtomicU64,
    stops: AtomicU64,
    restarts: AtomicU64,
    removes: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a workload directly, as if it predates the daemon.
    pub fn seed_workload(&self, name: &str, state: WorkloadState) -> String {
        let handle = format!("ctr-{}", self.next_handle.fetch_add(1, Ordering::SeqCst));
        let info = WorkloadInfo {
            id: handle.clone(),
            name: name.to_string(),
            state,
            started_at: (state == WorkloadState::Running).then(Utc::now),
            ip_address: Some("172.17.0.2".to_string()),
            mounts: Vec::new(),
        };
        self.workloads.lock().unwrap().insert(handle.clone(), info);
        handle
    }

    /// Drop a workload without going through `remove`, simulating a
    /// container that vanished out from under the daemon.
    pub fn forget_workload(&self, handle: &str) {
        self.workloads.lock().unwrap().remove(handle);
    }

    pub fn set_raw_stats(&self, handle: &str, raw: RawStats) {
        self.raw_stats
            .lock()
            .unwrap()
            .insert(handle.to_string(), raw);
    }

    pub fn inspect_blocking(&self, handle: &str) -> Option<WorkloadInfo> {
        self.workloads.lock().unwrap().get(handle).cloned()
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.lock().unwrap().len()
    }

    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Total count of mutating operations issued against the engine.
    pub fn mutation_count(&self) -> u64 {
        [
            &self.creates,
            &self.starts,
            &self.stops,
            &self.restarts,
            &self.removes,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }

    pub fn op_log(&self) -> Vec<String> {
        self.op_log.lock().unwrap().clone()
    }

    fn log(&self, entry: String) {
        self.op_log.lock().unwrap().push(entry);
    }

    fn with_workload<T>(
        &self,
        handle: &str,
        f: impl FnOnce(&mut WorkloadInfo) -> T,
    ) -> Result<T, RuntimeError> {
        let mut workloads = self.workloads.lock().unwrap();
        match workloads.get_mut(handle) {
            Some(info) => Ok(f(info)),
            None => Err(RuntimeError::NotFound(handle.to_string())),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &WorkloadSpec) -> Result<String, RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let handle = format!("ctr-{}", self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.log(format!("create {handle}"));
        let info = WorkloadInfo {
            id: handle.clone(),
            name: spec.name.clone(),
            state: WorkloadState::Running,
            started_at: Some(Utc::now()),
            ip_address: Some("172.17.0.2".to_string()),
            mounts: Vec::new(),
        };
        self.workloads.lock().unwrap().insert(handle.clone(), info);
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.log(format!("start {handle}"));
        self.with_workload(handle, |info| {
            info.state = WorkloadState::Running;
            info.started_at = Some(Utc::now());
        })
    }

    async fn stop(&self, handle: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.log(format!("stop {handle}"));
        self.with_workload(handle, |info| {
            info.state = WorkloadState::Stopped;
        })
    }

    async fn restart(&self, handle: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.log(format!("restart {handle}"));
        self.with_workload(handle, |info| {
            info.state = WorkloadState::Running;
            info.started_at = Some(Utc::now());
        })
    }

    async fn inspect(&self, handle: &str) -> Result<WorkloadInfo, RuntimeError> {
        self.inspect_blocking(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))
    }

    async fn stats(&self, handle: &str) -> Result<RawStats, RuntimeError> {
        if self.inspect_blocking(handle).is_none() {
            return Err(RuntimeError::NotFound(handle.to_string()));
        }
        Ok(self
            .raw_stats
            .lock()
            .unwrap()
            .get(handle)
            .copied()
            .unwrap_or_default())
    }

    async fn list_managed(&self) -> Result<Vec<WorkloadInfo>, RuntimeError> {
        Ok(self.workloads.lock().unwrap().values().cloned().collect())
    }

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.log(format!("remove {handle}"));
        match self.workloads.lock().unwrap().remove(handle) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(handle.to_string())),
        }
    }
}

/// Control-plane fake that applies status write-backs to its stored
/// records, so a subsequent cache refresh observes them the way the real
/// panel would.
#[derive(Default)]
pub struct FakeControlPlane {
    servers: Mutex<HashMap<ServerId, ServerRecord>>,
    pending: Mutex<Vec<PendingAction>>,
    completed: Mutex<Vec<ActionId>>,
    stats: Mutex<Vec<(ServerId, StatsSnapshot)>>,
    system_stats: Mutex<Vec<SystemStats>>,
    backups: Mutex<Vec<(ServerId, BackupArtifact)>>,
    fail_register: AtomicBool,
    fail_fetch_servers: AtomicBool,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_server(&self, record: ServerRecord) {
        self.servers.lock().unwrap().insert(record.id, record);
    }

    pub fn server(&self, id: ServerId) -> Option<ServerRecord> {
        self.servers.lock().unwrap().get(&id).cloned()
    }

    pub fn enqueue_action(&self, action: PendingAction) {
        self.pending.lock().unwrap().push(action);
    }

    pub fn completed_actions(&self) -> Vec<ActionId> {
        self.completed.lock().unwrap().clone()
    }

    pub fn reported_stats(&self) -> Vec<(ServerId, StatsSnapshot)> {
        self.stats.lock().unwrap().clone()
    }

    pub fn reported_system_stats(&self) -> Vec<SystemStats> {
        self.system_stats.lock().unwrap().clone()
    }

    pub fn registered_backups(&self) -> Vec<(ServerId, BackupArtifact)> {
        self.backups.lock().unwrap().clone()
    }

    pub fn fail_backup_registration(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetch_servers(&self, fail: bool) {
        self.fail_fetch_servers.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn fetch_servers(&self) -> Result<Vec<ServerRecord>, ControlPlaneError> {
        if self.fail_fetch_servers.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Http("connection refused".to_string()));
        }
        let mut servers: Vec<_> = self.servers.lock().unwrap().values().cloned().collect();
        servers.sort_by_key(|s| s.id);
        Ok(servers)
    }

    async fn fetch_pending_actions(&self) -> Result<Vec<PendingAction>, ControlPlaneError> {
        Ok(self.pending.lock().unwrap().clone())
    }

    async fn report_status(
        &self,
        server_id: ServerId,
        status: ServerStatus,
        handle: HandleUpdate,
    ) -> Result<(), ControlPlaneError> {
        let mut servers = self.servers.lock().unwrap();
        if let Some(record) = servers.get_mut(&server_id) {
            record.status = status;
            match handle {
                HandleUpdate::Unchanged => {}
                HandleUpdate::Set(h) => record.container_id = Some(h),
                HandleUpdate::Clear => record.container_id = None,
            }
        }
        Ok(())
    }

    async fn report_stats(
        &self,
        server_id: ServerId,
        stats: &StatsSnapshot,
    ) -> Result<(), ControlPlaneError> {
        self.stats.lock().unwrap().push((server_id, *stats));
        Ok(())
    }

    async fn report_system_stats(&self, stats: &SystemStats) -> Result<(), ControlPlaneError> {
        self.system_stats.lock().unwrap().push(*stats);
        Ok(())
    }

    async fn register_backup(
        &self,
        server_id: ServerId,
        artifact: &BackupArtifact,
    ) -> Result<(), ControlPlaneError> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Status {
                code: 500,
                body: "backup store unavailable".to_string(),
            });
        }
        self.backups
            .lock()
            .unwrap()
            .push((server_id, artifact.clone()));
        Ok(())
    }

    async fn complete_action(&self, action_id: ActionId) -> Result<(), ControlPlaneError> {
        self.completed.lock().unwrap().push(action_id);
        self.pending.lock().unwrap().retain(|a| a.id != action_id);
        Ok(())
    }
}

/// Constant host stats, enough for cadence assertions.
#[derive(Default)]
pub struct FakeSampler;

#[async_trait]
impl SystemSampler for FakeSampler {
    async fn sample(&self) -> SystemStats {
        SystemStats {
            cpu_percent: 12.5,
            memory_used: 4 << 30,
            memory_total: 16 << 30,
            memory_percent: 25.0,
            disk_used: 100 << 30,
            disk_total: 500 << 30,
            disk_percent: 20.0,
        }
    }
}
