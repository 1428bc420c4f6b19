//! Persisted accounting state: per-node memory tables and container
//! assignments.

pub mod checkpoint;

pub use checkpoint::CheckpointState;

use crate::resources::ResourceName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// NUMA node identifier.
pub type NodeId = usize;

/// Accounting for one resource class on one NUMA node.
///
/// Invariant: `free + reserved == allocatable` and
/// `allocatable == total - system_reserved` (minus the hugepage carve-out
/// for the regular class).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTable {
    pub total: u64,
    pub system_reserved: u64,
    pub allocatable: u64,
    pub free: u64,
    pub reserved: u64,
}

/// Book-keeping for one NUMA node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Accounting per resource class (regular memory plus hugepage classes).
    pub memory_map: BTreeMap<ResourceName, MemoryTable>,
    /// Number of memory blocks currently pinned to this node.
    pub assignments: u32,
    /// Sorted set of nodes cooperatively backing every assignment on this
    /// node; degenerates to `{self}` when `assignments == 0`.
    pub group: Vec<NodeId>,
}

/// Machine state: accounting for every NUMA node, keyed by node id.
///
/// A `BTreeMap` so iteration is always in ascending node order.
pub type NodeMap = BTreeMap<NodeId, NodeState>;

/// One reservation of memory for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Sorted NUMA node ids backing the reservation.
    pub numa_affinity: Vec<NodeId>,
    /// Resource class reserved.
    pub resource: ResourceName,
    /// Bytes taken out of `free`.
    pub size: u64,
    /// Bytes satisfied from the pod's reusable pool instead of `free`.
    pub reused: u64,
}

/// All reservations, keyed by pod uid then container name.
pub type MemoryAssignments = BTreeMap<String, BTreeMap<String, Vec<Block>>>;

/// Store for machine state and container assignments.
///
/// Snapshots returned by the getters are deep clones; mutating them never
/// affects the store.
pub trait StateStore: Send {
    /// Snapshot of the machine state.
    fn machine_state(&self) -> NodeMap;

    /// Replace the machine state.
    fn set_machine_state(&mut self, machine_state: NodeMap);

    /// Blocks reserved for one container, if any.
    fn memory_blocks(&self, pod_uid: &str, container_name: &str) -> Option<Vec<Block>>;

    /// Record the blocks reserved for one container.
    fn set_memory_blocks(&mut self, pod_uid: &str, container_name: &str, blocks: Vec<Block>);

    /// Snapshot of every assignment.
    fn memory_assignments(&self) -> MemoryAssignments;

    /// Replace every assignment.
    fn set_memory_assignments(&mut self, assignments: MemoryAssignments);

    /// Drop one container's assignment; prunes the pod entry when it was the
    /// last container. No-op when absent.
    fn delete(&mut self, pod_uid: &str, container_name: &str);

    /// Drop all state.
    fn clear(&mut self);
}

/// Plain in-memory state store.
#[derive(Debug, Default)]
pub struct MemoryState {
    machine_state: NodeMap,
    assignments: MemoryAssignments,
}

impl MemoryState {
    pub fn new() -> Self {
        MemoryState::default()
    }
}

impl StateStore for MemoryState {
    fn machine_state(&self) -> NodeMap {
        self.machine_state.clone()
    }

    fn set_machine_state(&mut self, machine_state: NodeMap) {
        self.machine_state = machine_state;
    }

    fn memory_blocks(&self, pod_uid: &str, container_name: &str) -> Option<Vec<Block>> {
        self.assignments
            .get(pod_uid)
            .and_then(|containers| containers.get(container_name))
            .cloned()
    }

    fn set_memory_blocks(&mut self, pod_uid: &str, container_name: &str, blocks: Vec<Block>) {
        self.assignments
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string(), blocks);
    }

    fn memory_assignments(&self) -> MemoryAssignments {
        self.assignments.clone()
    }

    fn set_memory_assignments(&mut self, assignments: MemoryAssignments) {
        self.assignments = assignments;
    }

    fn delete(&mut self, pod_uid: &str, container_name: &str) {
        if let Some(containers) = self.assignments.get_mut(pod_uid) {
            containers.remove(container_name);
            if containers.is_empty() {
                self.assignments.remove(pod_uid);
            }
        }
    }

    fn clear(&mut self) {
        self.machine_state.clear();
        self.assignments.clear();
    }
}
