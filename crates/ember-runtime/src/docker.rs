use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, RestartContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerStateStatusEnum, HostConfig, MountPointTypeEnum, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, instrument};

use ember_common::{
    ContainerRuntime, RawStats, RuntimeError, VolumeMount, WorkloadInfo, WorkloadSpec,
    WorkloadState, MANAGED_LABEL,
};

/// CFS period matching the engine's 100ms convention; quotas in
/// `WorkloadSpec` are expressed against this.
const CPU_PERIOD_US: i64 = 100_000;

/// `ContainerRuntime` over a local Docker engine.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    /// Connect to the local engine and verify it answers. Failing here is
    /// fatal to the daemon, so surface the error untranslated.
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }
}

fn map_docker_err(handle: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(handle.to_string()),
        other => RuntimeError::Api(other.to_string()),
    }
}

fn workload_state(status: Option<ContainerStateStatusEnum>) -> WorkloadState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => WorkloadState::Created,
        Some(ContainerStateStatusEnum::RUNNING) | Some(ContainerStateStatusEnum::RESTARTING) => {
            WorkloadState::Running
        }
        Some(ContainerStateStatusEnum::PAUSED) => WorkloadState::Paused,
        Some(ContainerStateStatusEnum::REMOVING) => WorkloadState::Removed,
        _ => WorkloadState::Stopped,
    }
}

fn parse_started_at(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw?).ok()?;
    // The engine reports a zero timestamp for containers that never started.
    if parsed.timestamp() <= 0 {
        return None;
    }
    Some(parsed.with_timezone(&Utc))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &WorkloadSpec) -> Result<String, RuntimeError> {
        let port_key = format!("{}/tcp", spec.port);

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            cpu_quota: Some(spec.cpu_quota_us),
            cpu_period: Some(CPU_PERIOD_US),
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.iter().cloned().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| map_docker_err(&spec.name, e))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| map_docker_err(&created.id, e))?;

        debug!(handle = %created.id, "created and started workload");
        Ok(created.id)
    }

    async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container::<String>(handle, None)
            .await
            .map_err(|e| map_docker_err(handle, e))
    }

    async fn stop(&self, handle: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                handle,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(|e| map_docker_err(handle, e))
    }

    async fn restart(&self, handle: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.docker
            .restart_container(
                handle,
                Some(RestartContainerOptions {
                    t: grace.as_secs() as isize,
                }),
            )
            .await
            .map_err(|e| map_docker_err(handle, e))
    }

    async fn inspect(&self, handle: &str) -> Result<WorkloadInfo, RuntimeError> {
        let resp = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_err(handle, e))?;

        let state = resp.state.as_ref();
        let ip_address = resp
            .network_settings
            .as_ref()
            .and_then(|n| n.networks.as_ref())
            .and_then(|nets| nets.values().find_map(|e| e.ip_address.clone()))
            .filter(|ip| !ip.is_empty());

        let mounts = resp
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.typ == Some(MountPointTypeEnum::VOLUME))
            .filter_map(|m| {
                Some(VolumeMount {
                    name: m.name?,
                    source: m.source.unwrap_or_default(),
                    destination: m.destination.unwrap_or_default(),
                })
            })
            .collect();

        Ok(WorkloadInfo {
            id: resp.id.unwrap_or_else(|| handle.to_string()),
            name: resp
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            state: workload_state(state.and_then(|s| s.status)),
            started_at: parse_started_at(state.and_then(|s| s.started_at.as_deref())),
            ip_address,
            mounts,
        })
    }

    async fn stats(&self, handle: &str) -> Result<RawStats, RuntimeError> {
        let mut stream = self.docker.stats(
            handle,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        let sample = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::Api(format!("no stats sample for {handle}")))?
            .map_err(|e| map_docker_err(handle, e))?;

        Ok(RawStats {
            cpu_total_usage: sample.cpu_stats.cpu_usage.total_usage,
            precpu_total_usage: sample.precpu_stats.cpu_usage.total_usage,
            system_cpu_usage: sample.cpu_stats.system_cpu_usage,
            presystem_cpu_usage: sample.precpu_stats.system_cpu_usage,
            memory_usage_bytes: sample.memory_stats.usage.unwrap_or(0),
        })
    }

    async fn list_managed(&self) -> Result<Vec<WorkloadInfo>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        );

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Api(e.to_string()))?;

        let mut workloads = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            match self.inspect(&id).await {
                Ok(info) => workloads.push(info),
                // Vanished between list and inspect; nothing to report.
                Err(RuntimeError::NotFound(_)) => {
                    debug!(handle = %id, "workload disappeared during listing")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(workloads)
    }

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_err(handle, e))
    }
}
