//! The emberpanel host daemon: reconciles desired server state from the
//! control plane against workloads on the local container engine.
//!
//! The four core activities (action reconciliation, monitoring, orphan
//! reaping, backups) are composed by [`daemon::Daemon`] on independent
//! cadences within a single cooperative loop. All external effects go
//! through the injected `ControlPlane` and `ContainerRuntime` capabilities,
//! which is what keeps the core testable against the in-memory fakes in
//! [`test_utils`].

pub mod backup;
pub mod config;
pub mod daemon;
pub mod monitor;
pub mod reaper;
pub mod reconciler;
pub mod test_utils;

pub use config::DaemonConfig;
pub use daemon::Daemon;
