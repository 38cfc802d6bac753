use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{info, instrument, warn};

use ember_common::{
    BackupArtifact, ControlPlane, DaemonError, ServerRecord, VolumeMount, WorkloadInfo,
};

/// Snapshots a workload's persistent volumes into a compressed archive and
/// registers the artifact with the control plane. Archives live under
/// `<backup_root>/<server_id>/<name>_<timestamp>.tar.gz` and are never
/// rolled back: a failed registration leaves the file in place, discoverable
/// for manual reconciliation.
pub struct BackupExecutor {
    control: Arc<dyn ControlPlane>,
    backup_root: PathBuf,
    /// Host directory holding the engine's named volumes; each volume's data
    /// sits under `<volumes_root>/<name>/_data`.
    volumes_root: PathBuf,
}

impl BackupExecutor {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        backup_root: PathBuf,
        volumes_root: PathBuf,
    ) -> Self {
        Self {
            control,
            backup_root,
            volumes_root,
        }
    }

    /// Archive the workload's volumes. The caller has already resolved the
    /// workload and verified it is running.
    #[instrument(skip(self, record, workload), fields(server_id = record.id))]
    pub async fn create(
        &self,
        record: &ServerRecord,
        workload: &WorkloadInfo,
    ) -> Result<BackupArtifact, DaemonError> {
        if workload.mounts.is_empty() {
            return Err(DaemonError::Validation(format!(
                "nothing to back up for server {}",
                record.id
            )));
        }

        let dir = self.backup_root.join(record.id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let created_at = Utc::now();
        let name = format!(
            "{}_{}.tar.gz",
            record.name,
            created_at.format("%Y%m%d_%H%M%S")
        );
        let path = dir.join(&name);

        let mounts = workload.mounts.clone();
        let volumes_root = self.volumes_root.clone();
        let archive_path = path.clone();
        tokio::task::spawn_blocking(move || write_archive(&archive_path, &volumes_root, &mounts))
            .await
            .map_err(|e| DaemonError::Backup(format!("archive task failed: {e}")))??;

        let size_bytes = tokio::fs::metadata(&path).await?.len();
        let artifact = BackupArtifact {
            name,
            path: path.display().to_string(),
            size_bytes,
            created_at,
            server_id: record.id,
        };

        if let Err(e) = self.control.register_backup(record.id, &artifact).await {
            // Complete but unregistered; the archive stays on disk.
            warn!(
                error = %e,
                path = %artifact.path,
                "backup registration failed, archive retained"
            );
        }

        info!(
            path = %artifact.path,
            size_bytes = artifact.size_bytes,
            "backup created"
        );
        Ok(artifact)
    }
}

fn write_archive(
    path: &Path,
    volumes_root: &Path,
    mounts: &[VolumeMount],
) -> Result<(), DaemonError> {
    let file = std::fs::File::create(path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut archive = tar::Builder::new(encoder);

    for mount in mounts {
        let data = volumes_root.join(&mount.name).join("_data");
        let arcname = mount.destination.trim_start_matches('/');
        let arcname = if arcname.is_empty() {
            mount.name.as_str()
        } else {
            arcname
        };
        archive
            .append_dir_all(arcname, &data)
            .map_err(|e| DaemonError::Backup(format!("archiving volume {}: {e}", mount.name)))?;
    }

    archive
        .into_inner()
        .map_err(|e| DaemonError::Backup(format!("finishing archive: {e}")))?
        .finish()
        .map_err(|e| DaemonError::Backup(format!("flushing archive: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{running_server, FakeControlPlane};
    use ember_common::WorkloadState;

    fn workload_with_volume(handle: &str, volume: &str) -> WorkloadInfo {
        WorkloadInfo {
            id: handle.to_string(),
            name: "ember-server-1".to_string(),
            state: WorkloadState::Running,
            started_at: Some(Utc::now()),
            ip_address: None,
            mounts: vec![VolumeMount {
                name: volume.to_string(),
                source: format!("/var/lib/docker/volumes/{volume}/_data"),
                destination: "/data".to_string(),
            }],
        }
    }

    fn seed_volume(root: &Path, volume: &str) {
        let data = root.join(volume).join("_data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("world.dat"), b"chunk data").unwrap();
    }

    #[tokio::test]
    async fn backup_writes_archive_and_registers_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let volumes_root = dir.path().join("volumes");
        seed_volume(&volumes_root, "vol-1");

        let control = Arc::new(FakeControlPlane::new());
        let executor = BackupExecutor::new(
            control.clone(),
            dir.path().join("backups"),
            volumes_root,
        );

        let record = running_server(1, "ctr-1");
        let artifact = executor
            .create(&record, &workload_with_volume("ctr-1", "vol-1"))
            .await
            .unwrap();

        assert!(artifact.name.starts_with(&format!("{}_", record.name)));
        assert!(artifact.name.ends_with(".tar.gz"));
        assert!(artifact.size_bytes > 0);
        assert!(Path::new(&artifact.path).exists());
        assert_eq!(control.registered_backups().len(), 1);
    }

    #[tokio::test]
    async fn registration_failure_retains_archive() {
        let dir = tempfile::tempdir().unwrap();
        let volumes_root = dir.path().join("volumes");
        seed_volume(&volumes_root, "vol-1");

        let control = Arc::new(FakeControlPlane::new());
        control.fail_backup_registration(true);
        let executor = BackupExecutor::new(
            control.clone(),
            dir.path().join("backups"),
            volumes_root,
        );

        let record = running_server(1, "ctr-1");
        let artifact = executor
            .create(&record, &workload_with_volume("ctr-1", "vol-1"))
            .await
            .unwrap();

        assert!(
            Path::new(&artifact.path).exists(),
            "archive must survive a failed registration"
        );
        assert!(control.registered_backups().is_empty());
    }

    #[tokio::test]
    async fn backup_with_no_volumes_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(FakeControlPlane::new());
        let executor = BackupExecutor::new(
            control,
            dir.path().join("backups"),
            dir.path().join("volumes"),
        );

        let record = running_server(1, "ctr-1");
        let workload = WorkloadInfo {
            id: "ctr-1".to_string(),
            name: "ember-server-1".to_string(),
            state: WorkloadState::Running,
            started_at: Some(Utc::now()),
            ip_address: None,
            mounts: Vec::new(),
        };
        let err = executor.create(&record, &workload).await.unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
    }
}
