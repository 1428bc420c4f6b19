//! Host NUMA topology as discovered by the node agent.

use crate::resources::ResourceName;

/// Hugepage pool of one NUMA node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HugePagesInfo {
    /// Page size in KiB (2 MiB pages report 2048, 1 GiB pages 1048576).
    pub page_size_kib: u64,
    /// Number of pre-allocated pages of this size.
    pub num_pages: u64,
}

impl HugePagesInfo {
    /// Page size in bytes.
    pub fn page_size_bytes(&self) -> u64 {
        self.page_size_kib * 1024
    }

    /// Total bytes held by this hugepage pool.
    pub fn total_bytes(&self) -> u64 {
        self.num_pages * self.page_size_bytes()
    }

    /// The resource class this pool backs.
    pub fn resource_name(&self) -> ResourceName {
        ResourceName::hugepages(self.page_size_bytes())
    }
}

/// One NUMA node of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaNodeInfo {
    pub id: usize,
    /// Total memory in bytes, hugepage pools included.
    pub memory: u64,
    pub hugepages: Vec<HugePagesInfo>,
}

/// Host topology snapshot used to build the default machine state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineInfo {
    pub nodes: Vec<NumaNodeInfo>,
}

impl MachineInfo {
    /// NUMA node ids, ascending.
    pub fn node_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.nodes.iter().map(|n| n.id).collect();
        ids.sort_unstable();
        ids
    }
}
