//! Container runtime adapter contract.

use crate::error::Result;

/// Linux resource knobs this core produces for a container.
///
/// Only the NUMA memory set is populated here; the runtime adapter owns the
/// translation into actual cgroup writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinuxResources {
    /// Comma-separated NUMA node list for `cpuset.mems`, e.g. `"0,1"`.
    pub cpuset_mems: String,
}

/// Applies resource updates to running containers.
///
/// Errors from this adapter are logged by the manager and never fail
/// admission.
pub trait RuntimeService: Send + Sync {
    fn update_container_resources(
        &self,
        container_id: &str,
        resources: &LinuxResources,
    ) -> Result<()>;
}
