//! End-to-end cycle scenario against the in-memory fakes: start a server,
//! stop it, then lose its container and watch the monitor correct the drift.

use std::sync::Arc;

use ember_common::{ActionKind, ServerStatus, WorkloadState};
use ember_daemon::test_utils::{action, stopped_server, FakeControlPlane, FakeRuntime, FakeSampler};
use ember_daemon::{Daemon, DaemonConfig};

fn daemon(
    runtime: &Arc<FakeRuntime>,
    control: &Arc<FakeControlPlane>,
    dir: &tempfile::TempDir,
) -> Daemon {
    let config = DaemonConfig {
        backup_dir: dir.path().join("backups"),
        volumes_root: dir.path().join("volumes"),
        stats_interval_secs: 3600,
        backup_interval_secs: 3600,
        reap_interval_secs: 3600,
        ..DaemonConfig::default()
    };
    Daemon::new(
        config,
        runtime.clone(),
        control.clone(),
        Arc::new(FakeSampler),
    )
}

#[tokio::test]
async fn server_lifecycle_across_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let control = Arc::new(FakeControlPlane::new());

    let mut server = stopped_server(1);
    server.image = "mc:latest".to_string();
    server.memory_limit_mb = 1024;
    server.cpu_limit = 1.0;
    server.port = 25565;
    control.put_server(server);

    let mut daemon = daemon(&runtime, &control, &dir);

    // Cycle 1: start.
    control.enqueue_action(action(10, 1, ActionKind::Start));
    daemon.run_cycle().await;

    let record = control.server(1).unwrap();
    assert_eq!(record.status, ServerStatus::Running);
    let handle = record.container_id.expect("start must persist a handle");
    let workload = runtime.inspect_blocking(&handle).unwrap();
    assert_eq!(workload.state, WorkloadState::Running);
    assert_eq!(workload.name, "ember-server-1");
    assert_eq!(control.completed_actions(), vec![10]);

    // Cycle 2: stop. The handle is kept for reuse.
    control.enqueue_action(action(11, 1, ActionKind::Stop));
    daemon.run_cycle().await;

    let record = control.server(1).unwrap();
    assert_eq!(record.status, ServerStatus::Stopped);
    assert_eq!(record.container_id.as_deref(), Some(handle.as_str()));
    assert_eq!(
        runtime.inspect_blocking(&handle).unwrap().state,
        WorkloadState::Stopped
    );

    // Start again, then lose the container out from under the daemon.
    control.enqueue_action(action(12, 1, ActionKind::Start));
    daemon.run_cycle().await;
    assert_eq!(control.server(1).unwrap().status, ServerStatus::Running);

    runtime.forget_workload(&handle);
    daemon.run_cycle().await;

    let record = control.server(1).unwrap();
    assert_eq!(record.status, ServerStatus::Error);
    assert_eq!(record.container_id, None, "monitor must clear the handle");
}

#[tokio::test]
async fn start_is_idempotent_across_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let control = Arc::new(FakeControlPlane::new());
    control.put_server(stopped_server(1));

    let mut daemon = daemon(&runtime, &control, &dir);

    control.enqueue_action(action(10, 1, ActionKind::Start));
    daemon.run_cycle().await;
    let mutations = runtime.mutation_count();
    assert_eq!(runtime.creates(), 1);

    control.enqueue_action(action(11, 1, ActionKind::Start));
    daemon.run_cycle().await;

    assert_eq!(
        runtime.mutation_count(),
        mutations,
        "second start of a running server must not touch the runtime"
    );
    assert_eq!(control.server(1).unwrap().status, ServerStatus::Running);
}

#[tokio::test]
async fn uncompleted_actions_are_redelivered_and_converge() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let control = Arc::new(FakeControlPlane::new());
    control.put_server(stopped_server(1));

    let mut daemon = daemon(&runtime, &control, &dir);

    // The fake redelivers anything not completed; a successful cycle both
    // applies and completes, so a second cycle sees an empty queue.
    control.enqueue_action(action(10, 1, ActionKind::Start));
    daemon.run_cycle().await;
    daemon.run_cycle().await;

    assert_eq!(control.completed_actions(), vec![10]);
    assert_eq!(runtime.creates(), 1);
}
