//! Memory manager facade binding policy, state and the runtime adapter.

use crate::config::{Config, MemoryPolicyKind};
use crate::error::Result;
use crate::machine::MachineInfo;
use crate::memory::{NonePolicy, Policy, StaticPolicy};
use crate::pod::{Container, Pod};
use crate::runtime::{LinuxResources, RuntimeService};
use crate::state::StateStore;
use crate::topology::{AffinityStore, HintProvider, HintsMap};
use log::{error, info};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[cfg(feature = "telemetry")]
use crate::telemetry::Metrics;

struct ManagerInner {
    policy: Box<dyn Policy>,
    state: Box<dyn StateStore>,
    /// container id -> (pod uid, container name)
    container_map: HashMap<String, (String, String)>,
}

/// Serializes every read and write of machine state, assignments and the
/// container index behind one mutex, and exposes the policy as a hint
/// provider to the topology scope.
pub struct MemoryManager {
    inner: Mutex<ManagerInner>,
    affinity: Arc<AffinityStore>,
    runtime: Option<Arc<dyn RuntimeService>>,
    #[cfg(feature = "telemetry")]
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("policy", &self.inner.lock().policy.name())
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Build a manager from configuration, host topology and a state store.
    pub fn new(
        config: &Config,
        machine_info: MachineInfo,
        affinity: Arc<AffinityStore>,
        state: Box<dyn StateStore>,
    ) -> Result<Self> {
        let policy: Box<dyn Policy> = match config.memory_policy {
            MemoryPolicyKind::None => Box::new(NonePolicy::new()),
            MemoryPolicyKind::Static => Box::new(StaticPolicy::new(
                machine_info,
                config.reserved_memory.clone(),
                affinity.clone(),
            )?),
        };

        Ok(MemoryManager {
            inner: Mutex::new(ManagerInner {
                policy,
                state,
                container_map: HashMap::new(),
            }),
            affinity,
            runtime: None,
            #[cfg(feature = "telemetry")]
            metrics: None,
        })
    }

    /// Attach a runtime adapter that receives cgroup updates.
    pub fn with_runtime(mut self, runtime: Arc<dyn RuntimeService>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Record allocation metrics on this collector.
    #[cfg(feature = "telemetry")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy_name(&self) -> &'static str {
        self.inner.lock().policy.name()
    }

    /// Validate or initialize persisted state. Must succeed before any
    /// admission traffic.
    pub fn start(&self) -> Result<()> {
        info!("starting memory manager");
        let guard = &mut *self.inner.lock();
        guard.policy.start(guard.state.as_mut())
    }

    /// Reserve memory for one container of an admitted pod.
    pub fn allocate(&self, pod: &Pod, container: &Container) -> Result<()> {
        let guard = &mut *self.inner.lock();
        guard.policy.allocate(guard.state.as_mut(), pod, container)?;

        #[cfg(feature = "telemetry")]
        if let Some(metrics) = &self.metrics {
            metrics.record_allocation();
        }
        Ok(())
    }

    /// Bind a started container id to its pod and push the placement to the
    /// runtime. Runtime failures are logged, never fatal.
    pub fn add_container(&self, pod: &Pod, container_name: &str, container_id: &str) {
        let guard = &mut *self.inner.lock();
        guard.container_map.insert(
            container_id.to_string(),
            (pod.uid.clone(), container_name.to_string()),
        );

        let Some(runtime) = &self.runtime else {
            return;
        };
        let Some(blocks) = guard.state.memory_blocks(&pod.uid, container_name) else {
            return;
        };
        let mut nodes: Vec<usize> = blocks
            .iter()
            .flat_map(|block| block.numa_affinity.iter().copied())
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        if nodes.is_empty() {
            return;
        }

        let resources = LinuxResources {
            cpuset_mems: nodes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        };
        if let Err(err) = runtime.update_container_resources(container_id, &resources) {
            error!(
                "failed to update resources of container {}: {}",
                container_id, err
            );
        }
    }

    /// Release the container bound to `container_id`. Idempotent and silent
    /// for unknown ids.
    pub fn remove_container(&self, container_id: &str) -> Result<()> {
        let guard = &mut *self.inner.lock();
        let Some((pod_uid, container_name)) = guard.container_map.remove(container_id) else {
            return Ok(());
        };

        if let Err(err) =
            guard
                .policy
                .remove_container(guard.state.as_mut(), &pod_uid, &container_name)
        {
            // keep the binding so a retry can release the memory
            guard.container_map.insert(
                container_id.to_string(),
                (pod_uid.clone(), container_name.clone()),
            );
            return Err(err);
        }
        self.affinity.remove_container(&pod_uid, &container_name);

        #[cfg(feature = "telemetry")]
        if let Some(metrics) = &self.metrics {
            metrics.record_release();
        }
        Ok(())
    }

    /// Periodic sweep releasing assignments whose (pod, container) is no
    /// longer active.
    pub fn remove_stale_state(&self, active_pods: &[Pod]) {
        let active: HashSet<(&str, &str)> = active_pods
            .iter()
            .flat_map(|pod| {
                pod.all_containers()
                    .map(move |container| (pod.uid.as_str(), container.name.as_str()))
            })
            .collect();

        let guard = &mut *self.inner.lock();
        let assignments = guard.state.memory_assignments();
        for (pod_uid, containers) in &assignments {
            for container_name in containers.keys() {
                if active.contains(&(pod_uid.as_str(), container_name.as_str())) {
                    continue;
                }
                info!(
                    "removing stale state (pod: {}, container: {})",
                    pod_uid, container_name
                );
                if let Err(err) =
                    guard
                        .policy
                        .remove_container(guard.state.as_mut(), pod_uid, container_name)
                {
                    error!(
                        "failed to remove stale state (pod: {}, container: {}): {}",
                        pod_uid, container_name, err
                    );
                    continue;
                }
                self.affinity.remove_container(pod_uid, container_name);
                guard.container_map.retain(|_, (uid, name)| {
                    !(uid.as_str() == pod_uid.as_str() && name.as_str() == container_name.as_str())
                });
            }
        }
    }

    /// Deep-copied snapshot of the machine state.
    pub fn machine_state(&self) -> crate::state::NodeMap {
        self.inner.lock().state.machine_state()
    }

    /// Deep-copied snapshot of every assignment.
    pub fn memory_assignments(&self) -> crate::state::MemoryAssignments {
        self.inner.lock().state.memory_assignments()
    }

    /// Topology hints for one container, per requested resource.
    pub fn topology_hints(&self, pod: &Pod, container: &Container) -> HintsMap {
        let guard = self.inner.lock();
        guard.policy.container_hints(guard.state.as_ref(), pod, container)
    }

    /// Pod-level topology hints.
    pub fn pod_topology_hints(&self, pod: &Pod) -> HintsMap {
        let guard = self.inner.lock();
        guard.policy.pod_hints(guard.state.as_ref(), pod)
    }
}

impl HintProvider for MemoryManager {
    fn container_hints(&self, pod: &Pod, container: &Container) -> HintsMap {
        self.topology_hints(pod, container)
    }

    fn pod_hints(&self, pod: &Pod) -> HintsMap {
        self.pod_topology_hints(pod)
    }

    fn allocate(&self, pod: &Pod, container: &Container) -> Result<()> {
        MemoryManager::allocate(self, pod, container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{HugePagesInfo, NumaNodeInfo};
    use crate::resources::{Quantity, ResourceName};
    use crate::state::MemoryState;
    use parking_lot::Mutex as PlainMutex;

    const GB: u64 = 1 << 30;

    struct RecordingRuntime {
        updates: PlainMutex<Vec<(String, LinuxResources)>>,
        fail: bool,
    }

    impl RecordingRuntime {
        fn new(fail: bool) -> Self {
            RecordingRuntime {
                updates: PlainMutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl RuntimeService for RecordingRuntime {
        fn update_container_resources(
            &self,
            container_id: &str,
            resources: &LinuxResources,
        ) -> Result<()> {
            if self.fail {
                return Err(crate::error::Error::runtime("fake runtime error"));
            }
            self.updates
                .lock()
                .push((container_id.to_string(), resources.clone()));
            Ok(())
        }
    }

    fn machine_info() -> MachineInfo {
        MachineInfo {
            nodes: (0..2)
                .map(|id| NumaNodeInfo {
                    id,
                    memory: 128 * GB,
                    hugepages: vec![HugePagesInfo {
                        page_size_kib: 1048576,
                        num_pages: 10,
                    }],
                })
                .collect(),
        }
    }

    fn static_config() -> Config {
        Config::builder()
            .memory_policy(MemoryPolicyKind::Static)
            .reserve(0, ResourceName::memory(), GB)
            .reserve(1, ResourceName::memory(), GB)
            .build()
            .unwrap()
    }

    fn manager(runtime: Arc<RecordingRuntime>) -> MemoryManager {
        let manager = MemoryManager::new(
            &static_config(),
            machine_info(),
            Arc::new(AffinityStore::new()),
            Box::new(MemoryState::new()),
        )
        .unwrap()
        .with_runtime(runtime);
        manager.start().unwrap();
        manager
    }

    fn guaranteed_pod(uid: &str, memory: &str) -> Pod {
        Pod::new(uid, uid).with_container(
            Container::new("main").with_guaranteed(ResourceName::memory(), Quantity::new(memory)),
        )
    }

    #[test]
    fn test_add_container_pushes_cpuset_mems() {
        let runtime = Arc::new(RecordingRuntime::new(false));
        let manager = manager(runtime.clone());

        let pod = guaranteed_pod("pod-1", "1Gi");
        manager.allocate(&pod, &pod.containers[0]).unwrap();
        manager.add_container(&pod, "main", "cid-1");

        let updates = runtime.updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "cid-1");
        assert_eq!(updates[0].1.cpuset_mems, "0");
    }

    #[test]
    fn test_runtime_errors_are_not_fatal() {
        let runtime = Arc::new(RecordingRuntime::new(true));
        let manager = manager(runtime);

        let pod = guaranteed_pod("pod-1", "1Gi");
        manager.allocate(&pod, &pod.containers[0]).unwrap();
        manager.add_container(&pod, "main", "cid-1");

        // the container is still tracked and removable
        manager.remove_container("cid-1").unwrap();
    }

    #[test]
    fn test_remove_container_releases_memory() {
        let runtime = Arc::new(RecordingRuntime::new(false));
        let manager = manager(runtime);

        let pod = guaranteed_pod("pod-1", "1Gi");
        manager.allocate(&pod, &pod.containers[0]).unwrap();
        manager.add_container(&pod, "main", "cid-1");

        manager.remove_container("cid-1").unwrap();
        let hints = manager.topology_hints(&pod, &pod.containers[0]);
        // hints are recomputed, not regenerated: the assignment is gone
        assert_eq!(hints[&ResourceName::memory()].len(), 3);

        // unknown ids stay silent
        manager.remove_container("cid-1").unwrap();
        manager.remove_container("never-seen").unwrap();
    }

    #[test]
    fn test_remove_stale_state_sweeps_dead_pods() {
        let runtime = Arc::new(RecordingRuntime::new(false));
        let manager = manager(runtime);

        let dead = guaranteed_pod("pod-dead", "1Gi");
        let live = guaranteed_pod("pod-live", "1Gi");
        manager.allocate(&dead, &dead.containers[0]).unwrap();
        manager.allocate(&live, &live.containers[0]).unwrap();

        manager.remove_stale_state(std::slice::from_ref(&live));

        let assignments = manager.memory_assignments();
        assert!(!assignments.contains_key("pod-dead"));
        assert!(assignments.contains_key("pod-live"));
    }

    #[test]
    fn test_none_policy_never_touches_state() {
        let config = Config::builder().build().unwrap();
        let manager = MemoryManager::new(
            &config,
            machine_info(),
            Arc::new(AffinityStore::new()),
            Box::new(MemoryState::new()),
        )
        .unwrap();
        manager.start().unwrap();
        assert_eq!(manager.policy_name(), "none");

        let pod = guaranteed_pod("pod-1", "1Gi");
        manager.allocate(&pod, &pod.containers[0]).unwrap();
        assert!(manager.topology_hints(&pod, &pod.containers[0]).is_empty());
        assert!(manager.memory_assignments().is_empty());
    }
}
