//! Docker-backed implementation of the `ContainerRuntime` capability, plus
//! host-level stats sampling.

mod docker;
mod host;

pub use docker::DockerRuntime;
pub use host::HostSampler;

pub use bollard;
