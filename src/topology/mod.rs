//! Topology-hint reconciliation across resource controllers.
//!
//! Hint providers report, per requested resource, which NUMA node sets
//! could back a container. The policy merges those preferences by set
//! intersection and the scope turns the merged hint into an admit or deny
//! decision, recording the chosen affinity for providers to read back
//! during allocation.

pub mod policy;
pub mod scope;

pub use policy::TopologyPolicy;
pub use scope::{AdmitResult, DenyReason, Scope};

use crate::bitmask::BitMask;
use crate::error::Result;
use crate::pod::{Container, Pod};
use crate::resources::ResourceName;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Hints per requested resource, as returned by one provider.
///
/// A `BTreeMap` so the merge walks resources in a deterministic order.
pub type HintsMap = BTreeMap<ResourceName, Vec<TopologyHint>>;

/// A locality preference for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopologyHint {
    /// Acceptable NUMA nodes; `None` means no preference.
    pub affinity: Option<BitMask>,
    /// Whether this set is a locally-optimal choice.
    pub preferred: bool,
}

impl TopologyHint {
    pub fn new(affinity: Option<BitMask>, preferred: bool) -> Self {
        TopologyHint { affinity, preferred }
    }
}

impl fmt::Display for TopologyHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.affinity {
            Some(mask) => write!(f, "(affinity: {}, preferred: {})", mask, self.preferred),
            None => write!(f, "(affinity: none, preferred: {})", self.preferred),
        }
    }
}

/// A resource controller that reports NUMA locality preferences and
/// reserves resources once a pod is admitted.
pub trait HintProvider: Send + Sync {
    /// Hints for one container, per requested resource.
    fn container_hints(&self, pod: &Pod, container: &Container) -> HintsMap;

    /// Pod-level hints, used by the pod scope.
    fn pod_hints(&self, pod: &Pod) -> HintsMap;

    /// Reserve resources for an admitted container.
    fn allocate(&self, pod: &Pod, container: &Container) -> Result<()>;
}

/// Merged affinities per pod and container.
pub type PodTopologyHints = HashMap<String, HashMap<String, TopologyHint>>;

/// The affinity table: merged hints recorded at admission, read back by
/// hint providers during allocation.
///
/// Shared by the scope and the providers through an `Arc`; entries are
/// keyed by opaque pod uid and container name only.
#[derive(Debug, Default)]
pub struct AffinityStore {
    hints: Mutex<PodTopologyHints>,
}

impl AffinityStore {
    pub fn new() -> Self {
        AffinityStore::default()
    }

    /// The merged hint recorded for a container, or the default hint
    /// (no preference) when none was recorded.
    pub fn affinity(&self, pod_uid: &str, container_name: &str) -> TopologyHint {
        self.hints
            .lock()
            .get(pod_uid)
            .and_then(|containers| containers.get(container_name))
            .copied()
            .unwrap_or_default()
    }

    /// Record the merged hint for a container.
    pub fn set(&self, pod_uid: &str, container_name: &str, hint: TopologyHint) {
        self.hints
            .lock()
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string(), hint);
    }

    /// Drop one container's entry; the pod entry goes with its last
    /// container. No-op when absent.
    pub fn remove_container(&self, pod_uid: &str, container_name: &str) {
        let mut hints = self.hints.lock();
        if let Some(containers) = hints.get_mut(pod_uid) {
            containers.remove(container_name);
            if containers.is_empty() {
                hints.remove(pod_uid);
            }
        }
    }

    /// Drop every entry of a pod.
    pub fn remove_pod(&self, pod_uid: &str) {
        self.hints.lock().remove(pod_uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_defaults_to_no_preference() {
        let store = AffinityStore::new();
        assert_eq!(store.affinity("pod", "main"), TopologyHint::default());
    }

    #[test]
    fn test_set_and_read_back() {
        let store = AffinityStore::new();
        let hint = TopologyHint::new(Some(BitMask::from_nodes(&[0]).unwrap()), true);
        store.set("pod", "main", hint);
        assert_eq!(store.affinity("pod", "main"), hint);
        assert_eq!(store.affinity("pod", "other"), TopologyHint::default());
    }

    #[test]
    fn test_remove_prunes_empty_pod() {
        let store = AffinityStore::new();
        store.set("pod", "init", TopologyHint::default());
        store.set("pod", "main", TopologyHint::default());

        store.remove_container("pod", "init");
        assert!(store.hints.lock().contains_key("pod"));

        store.remove_container("pod", "main");
        assert!(!store.hints.lock().contains_key("pod"));

        // unknown entries are silent no-ops
        store.remove_container("pod", "main");
        store.remove_pod("other");
    }
}
