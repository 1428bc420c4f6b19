//! Static NUMA-aware memory placement for Guaranteed pods.

use super::Policy;
use crate::bitmask::{iterate_node_masks, BitMask};
use crate::config::ReservedMemory;
use crate::error::{Error, Result};
use crate::machine::MachineInfo;
use crate::pod::{Container, Pod, QosClass};
use crate::resources::ResourceName;
use crate::state::{Block, MemoryTable, NodeMap, NodeState, StateStore};
use crate::topology::{AffinityStore, HintsMap, TopologyHint};
use log::{debug, error, info};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Byte demand per requested memory resource class.
type RequestedResources = BTreeMap<ResourceName, u64>;

/// The static policy: computes placement hints against the per-node free
/// memory, reserves blocks when a container is admitted and releases them
/// when it goes away.
#[derive(Debug)]
pub struct StaticPolicy {
    machine_info: MachineInfo,
    system_reserved: ReservedMemory,
    /// Merged affinities recorded by the scope at admission.
    affinity: Arc<AffinityStore>,
    /// Init-container reservations the same pod's app containers may
    /// offset their demand against. Lives for one pod's admission sweep.
    memory_to_reuse: HashMap<String, Vec<Block>>,
}

impl StaticPolicy {
    pub fn new(
        machine_info: MachineInfo,
        system_reserved: ReservedMemory,
        affinity: Arc<AffinityStore>,
    ) -> Result<Self> {
        let total_reserved: u64 = system_reserved
            .values()
            .filter_map(|node| node.get(&ResourceName::memory()))
            .sum();
        if total_reserved == 0 {
            return Err(Error::config(
                "the static policy requires non-zero system-reserved memory",
            ));
        }

        Ok(StaticPolicy {
            machine_info,
            system_reserved,
            affinity,
            memory_to_reuse: HashMap::new(),
        })
    }

    /// Enumerate every NUMA node subset that could back the demand and emit
    /// one hint per requested resource for each viable subset.
    fn calculate_hints(
        &self,
        machine_state: &NodeMap,
        requested: &RequestedResources,
        reusable: &[Block],
    ) -> HintsMap {
        let numa_nodes: Vec<usize> = machine_state.keys().copied().collect();
        let mut min_affinity_size = numa_nodes.len();
        let mut hints = HintsMap::new();

        let result = iterate_node_masks(&numa_nodes, |mask| {
            let mask_bits = mask.bits();
            let single_numa = mask_bits.len() == 1;

            // a node grouped with others cannot serve a single-NUMA hint
            if single_numa && machine_state[&mask_bits[0]].group.len() > 1 {
                return;
            }

            // demand net of the reusable pool; a reusable pinned outside
            // the mask cannot be honored under it at all
            let mut demand = requested.clone();
            for block in reusable {
                if !requested.contains_key(&block.resource) {
                    continue;
                }
                if block.numa_affinity.iter().any(|&node| !mask.is_set(node)) {
                    return;
                }
                if let Some(size) = demand.get_mut(&block.resource) {
                    *size = size.saturating_sub(block.size);
                }
            }

            let mut total_free: BTreeMap<&ResourceName, u64> = BTreeMap::new();
            let mut total_allocatable: BTreeMap<&ResourceName, u64> = BTreeMap::new();
            for &node_id in &mask_bits {
                let node = &machine_state[&node_id];
                if !single_numa && node.assignments > 0 {
                    // single-NUMA assignments keep their node out of any
                    // multi-node mask, and grouped nodes only serve their
                    // exact group
                    if node.group.len() == 1 || node.group != mask_bits {
                        return;
                    }
                }

                for resource in demand.keys() {
                    let (free, allocatable) = node
                        .memory_map
                        .get(resource)
                        .map(|table| (table.free, table.allocatable))
                        .unwrap_or((0, 0));
                    *total_free.entry(resource).or_insert(0) += free;
                    *total_allocatable.entry(resource).or_insert(0) += allocatable;
                }
            }

            for (resource, &size) in &demand {
                if total_allocatable.get(resource).copied().unwrap_or(0) < size {
                    return;
                }
            }

            // this subset could ever fit the demand, so it participates in
            // the minimum-size ranking even when currently out of memory
            min_affinity_size = min_affinity_size.min(mask.count());

            for (resource, &size) in &demand {
                if total_free.get(resource).copied().unwrap_or(0) < size {
                    return;
                }
            }

            for resource in demand.keys() {
                hints
                    .entry((*resource).clone())
                    .or_default()
                    .push(TopologyHint::new(Some(mask), false));
            }
        });
        if let Err(err) = result {
            error!("failed to enumerate NUMA node subsets: {}", err);
            return HintsMap::new();
        }

        for resource_hints in hints.values_mut() {
            for hint in resource_hints.iter_mut() {
                hint.preferred = hint
                    .affinity
                    .map_or(false, |mask| mask.count() == min_affinity_size);
            }
        }
        hints
    }

    /// Best hint the policy itself would pick when the scope recorded no
    /// affinity for the container.
    fn default_hint(
        &self,
        machine_state: &NodeMap,
        requested: &RequestedResources,
        pod_uid: &str,
    ) -> Result<TopologyHint> {
        let reusable = self
            .memory_to_reuse
            .get(pod_uid)
            .cloned()
            .unwrap_or_default();
        let hints = self.calculate_hints(machine_state, requested, &reusable);
        // hint lists are identical across resources, so ranking the regular
        // memory list is enough
        let candidates = hints
            .get(&ResourceName::memory())
            .or_else(|| hints.values().next())
            .ok_or(Error::NoFeasibleHint)?;
        find_best_hint(candidates).ok_or(Error::NoFeasibleHint)
    }

    /// Widen a hint that cannot satisfy the demand to the best superset
    /// that can.
    fn extend_hint(
        &self,
        machine_state: &NodeMap,
        requested: &RequestedResources,
        mask: BitMask,
    ) -> Result<TopologyHint> {
        let hints = self.calculate_hints(machine_state, requested, &[]);
        let candidates = hints
            .get(&ResourceName::memory())
            .or_else(|| hints.values().next())
            .ok_or(Error::NoFeasibleHint)?;

        let supersets: Vec<TopologyHint> = candidates
            .iter()
            .filter(|hint| {
                hint.affinity
                    .map_or(false, |candidate| mask.and(candidate) == mask)
            })
            .copied()
            .collect();
        find_best_hint(&supersets).ok_or(Error::NoFeasibleHint)
    }

    fn default_machine_state(&self) -> NodeMap {
        let mut machine_state = NodeMap::new();
        for node in &self.machine_info.nodes {
            let mut node_state = NodeState {
                memory_map: BTreeMap::new(),
                assignments: 0,
                group: vec![node.id],
            };

            let mut hugepage_total = 0u64;
            for pool in &node.hugepages {
                let resource = pool.resource_name();
                let system_reserved = self.resource_system_reserved(node.id, &resource);
                let total = pool.total_bytes();
                let allocatable = total.saturating_sub(system_reserved);
                node_state.memory_map.insert(
                    resource,
                    MemoryTable {
                        total,
                        system_reserved,
                        allocatable,
                        free: allocatable,
                        reserved: 0,
                    },
                );
                hugepage_total += total;
            }

            // hugepage pools come out of the same physical memory, so the
            // regular class only gets what they leave behind
            let system_reserved = self.resource_system_reserved(node.id, &ResourceName::memory());
            let allocatable = node
                .memory
                .saturating_sub(system_reserved)
                .saturating_sub(hugepage_total);
            node_state.memory_map.insert(
                ResourceName::memory(),
                MemoryTable {
                    total: node.memory,
                    system_reserved,
                    allocatable,
                    free: allocatable,
                    reserved: 0,
                },
            );

            machine_state.insert(node.id, node_state);
        }
        machine_state
    }

    fn resource_system_reserved(&self, node_id: usize, resource: &ResourceName) -> u64 {
        self.system_reserved
            .get(&node_id)
            .and_then(|node| node.get(resource))
            .copied()
            .unwrap_or(0)
    }

    /// Refresh the pod-local reusable pool after an allocation.
    fn update_memory_to_reuse(&mut self, pod: &Pod, container: &Container, blocks: &[Block]) {
        // a different pod is being processed, earlier pools are dead
        self.memory_to_reuse.retain(|pod_uid, _| pod_uid == &pod.uid);

        if pod.is_init_container(&container.name) {
            debug!(
                "recording init container {:?} reservation for reuse",
                container.name
            );
            self.memory_to_reuse.insert(pod.uid.clone(), blocks.to_vec());
            return;
        }

        if let Some(reusable) = self.memory_to_reuse.get_mut(&pod.uid) {
            for block in blocks {
                for reusable_block in reusable.iter_mut() {
                    if reusable_block.resource == block.resource {
                        reusable_block.size = reusable_block.size.saturating_sub(block.reused);
                    }
                }
            }
        }
    }

    /// Re-simulate every assignment against a fresh default state and
    /// require the stored machine state to match it exactly.
    fn validate_state(&self, state: &mut dyn StateStore) -> Result<()> {
        let machine_state = state.machine_state();
        let assignments = state.memory_assignments();

        if machine_state.is_empty() {
            if !assignments.is_empty() {
                return Err(Error::corrupt(
                    "machine state cannot be empty when memory assignments exist",
                ));
            }
            state.set_machine_state(self.default_machine_state());
            return Ok(());
        }

        let mut expected = self.default_machine_state();
        for (pod_uid, containers) in &assignments {
            for (container_name, blocks) in containers {
                for block in blocks {
                    let mut remaining = block.size;
                    for &node_id in &block.numa_affinity {
                        let node = expected.get_mut(&node_id).ok_or_else(|| {
                            Error::corrupt(format!(
                                "(pod: {}, container: {}) assignment references NUMA node {} \
                                 that does not exist",
                                pod_uid, container_name, node_id
                            ))
                        })?;
                        node.assignments += 1;
                        node.group = block.numa_affinity.clone();

                        let table =
                            node.memory_map.get_mut(&block.resource).ok_or_else(|| {
                                Error::corrupt(format!(
                                    "(pod: {}, container: {}) assignment references resource {} \
                                     that does not exist",
                                    pod_uid, container_name, block.resource
                                ))
                            })?;
                        if remaining == 0 || table.free == 0 {
                            continue;
                        }
                        if table.free >= remaining {
                            table.reserved += remaining;
                            table.free -= remaining;
                            remaining = 0;
                        } else {
                            remaining -= table.free;
                            table.reserved += table.free;
                            table.free = 0;
                        }
                    }
                }
            }
        }

        if let Some(difference) = machine_state_difference(&machine_state, &expected) {
            return Err(Error::drift(difference));
        }
        Ok(())
    }
}

impl Policy for StaticPolicy {
    fn name(&self) -> &'static str {
        "static"
    }

    fn start(&mut self, state: &mut dyn StateStore) -> Result<()> {
        if let Err(err) = self.validate_state(state) {
            error!("invalid memory state: {}", err);
            return Err(err);
        }
        Ok(())
    }

    /// Idempotent: a container already present in state only refreshes the
    /// reusable pool.
    fn allocate(
        &mut self,
        state: &mut dyn StateStore,
        pod: &Pod,
        container: &Container,
    ) -> Result<()> {
        if pod.qos_class() != QosClass::Guaranteed {
            return Ok(());
        }
        debug!("allocate (pod: {}, container: {})", pod.name, container.name);

        if let Some(blocks) = state.memory_blocks(&pod.uid, &container.name) {
            debug!(
                "container already present in state, skipping (pod: {}, container: {})",
                pod.name, container.name
            );
            self.update_memory_to_reuse(pod, container, &blocks);
            return Ok(());
        }

        let requested = requested_resources(container)?;
        if requested.is_empty() {
            // nothing in the memory family to place
            return Ok(());
        }

        let machine_state = state.machine_state();

        let hint = self.affinity.affinity(&pod.uid, &container.name);
        debug!(
            "topology affinity for (pod: {}, container: {}): {}",
            pod.uid, container.name, hint
        );

        let mut best_hint = hint;
        if hint.affinity.is_none() {
            // no merged affinity was recorded; fall back to the same
            // calculation the scope's merge would have run
            let default_hint = self.default_hint(&machine_state, &requested, &pod.uid)?;
            if !default_hint.preferred && hint.preferred {
                return Err(Error::PreferredLost);
            }
            best_hint = default_hint;
        }

        let reusable = self
            .memory_to_reuse
            .get(&pod.uid)
            .cloned()
            .unwrap_or_default();
        let mut requested_absolute = requested.clone();
        for block in &reusable {
            if let Some(size) = requested_absolute.get_mut(&block.resource) {
                *size = size.saturating_sub(block.size);
            }
        }

        let mut mask = best_hint.affinity.ok_or(Error::NoFeasibleHint)?;
        if !affinity_satisfies_request(&machine_state, mask, &requested_absolute) {
            // the merge may have handed back a subset of what we offered;
            // widen it to a superset that holds the memory
            let extended_hint = self.extend_hint(&machine_state, &requested_absolute, mask)?;
            if !extended_hint.preferred && best_hint.preferred {
                return Err(Error::PreferredLost);
            }
            best_hint = extended_hint;
            mask = best_hint.affinity.ok_or(Error::NoFeasibleHint)?;
        }

        // stage everything on a local clone and only commit on success
        let mut machine_state = machine_state;
        let mask_bits = mask.bits();
        let mut container_blocks = Vec::with_capacity(requested_absolute.len());
        for (resource, &absolute_size) in &requested_absolute {
            container_blocks.push(Block {
                numa_affinity: mask_bits.clone(),
                resource: resource.clone(),
                size: absolute_size,
                reused: requested[resource] - absolute_size,
            });

            let mut remaining = absolute_size;
            for &node_id in &mask_bits {
                let Some(node) = machine_state.get_mut(&node_id) else {
                    continue;
                };
                // every node in the mask joins the group, contributing or not
                node.assignments += 1;
                node.group = mask_bits.clone();

                if remaining == 0 {
                    continue;
                }
                let Some(table) = node.memory_map.get_mut(resource) else {
                    continue;
                };
                if table.free == 0 {
                    continue;
                }
                if table.free >= remaining {
                    table.reserved += remaining;
                    table.free -= remaining;
                    remaining = 0;
                } else {
                    remaining -= table.free;
                    table.reserved += table.free;
                    table.free = 0;
                }
            }
        }

        state.set_machine_state(machine_state);
        state.set_memory_blocks(&pod.uid, &container.name, container_blocks.clone());
        self.update_memory_to_reuse(pod, container, &container_blocks);
        Ok(())
    }

    /// Idempotent: unknown containers are a silent no-op.
    fn remove_container(
        &mut self,
        state: &mut dyn StateStore,
        pod_uid: &str,
        container_name: &str,
    ) -> Result<()> {
        let Some(blocks) = state.memory_blocks(pod_uid, container_name) else {
            return Ok(());
        };
        info!("release (pod: {}, container: {})", pod_uid, container_name);

        let mut machine_state = state.machine_state();
        for block in &blocks {
            let mut remaining = block.size;
            for &node_id in &block.numa_affinity {
                let Some(node) = machine_state.get_mut(&node_id) else {
                    continue;
                };
                node.assignments = node.assignments.saturating_sub(1);
                if node.assignments == 0 {
                    node.group = vec![node_id];
                }

                if remaining == 0 {
                    continue;
                }
                let Some(table) = node.memory_map.get_mut(&block.resource) else {
                    continue;
                };
                if table.reserved == 0 {
                    continue;
                }
                if table.reserved < remaining {
                    remaining -= table.reserved;
                    table.free += table.reserved;
                    table.reserved = 0;
                } else {
                    table.free += remaining;
                    table.reserved -= remaining;
                    remaining = 0;
                }
            }
        }

        state.set_machine_state(machine_state);
        state.delete(pod_uid, container_name);
        Ok(())
    }

    fn container_hints(
        &self,
        state: &dyn StateStore,
        pod: &Pod,
        container: &Container,
    ) -> HintsMap {
        if pod.qos_class() != QosClass::Guaranteed {
            return HintsMap::new();
        }
        let requested = match requested_resources(container) {
            Ok(requested) => requested,
            Err(err) => {
                error!("{}", err);
                return HintsMap::new();
            }
        };

        // regenerate the recorded placement instead of recomputing, e.g.
        // after an agent restart
        if let Some(blocks) = state.memory_blocks(&pod.uid, &container.name) {
            return regenerate_hints(pod, container, &blocks, &requested);
        }

        let reusable = self
            .memory_to_reuse
            .get(&pod.uid)
            .cloned()
            .unwrap_or_default();
        self.calculate_hints(&state.machine_state(), &requested, &reusable)
    }

    fn pod_hints(&self, state: &dyn StateStore, pod: &Pod) -> HintsMap {
        if pod.qos_class() != QosClass::Guaranteed {
            return HintsMap::new();
        }
        let requested = match pod_requested_resources(pod) {
            Ok(requested) => requested,
            Err(err) => {
                error!("{}", err);
                return HintsMap::new();
            }
        };

        for container in pod.all_containers() {
            if let Some(blocks) = state.memory_blocks(&pod.uid, &container.name) {
                return regenerate_hints(pod, container, &blocks, &requested);
            }
        }
        self.calculate_hints(&state.machine_state(), &requested, &[])
    }
}

/// Memory-family requests of one container, in bytes.
fn requested_resources(container: &Container) -> Result<RequestedResources> {
    let mut requested = RequestedResources::new();
    for (resource, quantity) in &container.resources.requests {
        if !resource.is_memory_class() {
            continue;
        }
        requested.insert(resource.clone(), quantity.to_bytes()?);
    }
    Ok(requested)
}

/// Pod-level demand: init containers run sequentially so they contribute
/// their maximum, app containers run together so they contribute their sum;
/// the pod needs the larger of the two per resource.
fn pod_requested_resources(pod: &Pod) -> Result<RequestedResources> {
    let mut by_init = RequestedResources::new();
    for container in &pod.init_containers {
        for (resource, size) in requested_resources(container)? {
            let entry = by_init.entry(resource).or_insert(0);
            *entry = (*entry).max(size);
        }
    }

    let mut requested = RequestedResources::new();
    for container in &pod.containers {
        for (resource, size) in requested_resources(container)? {
            *requested.entry(resource).or_insert(0) += size;
        }
    }

    for (resource, size) in by_init {
        let entry = requested.entry(resource).or_insert(0);
        *entry = (*entry).max(size);
    }
    Ok(requested)
}

/// Whether the mask holds enough free bytes for every requested resource.
fn affinity_satisfies_request(
    machine_state: &NodeMap,
    mask: BitMask,
    requested: &RequestedResources,
) -> bool {
    for (resource, &size) in requested {
        let free: u64 = mask
            .bits()
            .iter()
            .filter_map(|node_id| machine_state.get(node_id))
            .filter_map(|node| node.memory_map.get(resource))
            .map(|table| table.free)
            .sum();
        if free < size {
            return false;
        }
    }
    true
}

/// Preferred first, then the narrowest affinity.
fn find_best_hint(hints: &[TopologyHint]) -> Option<TopologyHint> {
    let mut best: Option<TopologyHint> = None;
    for &hint in hints {
        let replace = match best {
            None => true,
            Some(current) => {
                (hint.preferred && !current.preferred)
                    || (hint.preferred == current.preferred
                        && match (hint.affinity, current.affinity) {
                            (Some(a), Some(b)) => a.is_narrower_than(b),
                            (Some(_), None) => true,
                            _ => false,
                        })
            }
        };
        if replace {
            best = Some(hint);
        }
    }
    best
}

/// Rebuild the hints an existing placement corresponds to.
///
/// Any disagreement between the stored blocks and the current request makes
/// every resource unsatisfiable, so the restricted-family policies deny
/// instead of silently re-placing.
fn regenerate_hints(
    pod: &Pod,
    container: &Container,
    blocks: &[Block],
    requested: &RequestedResources,
) -> HintsMap {
    let unsatisfiable: HintsMap = requested
        .keys()
        .map(|resource| (resource.clone(), Vec::new()))
        .collect();

    if blocks.len() != requested.len() {
        error!(
            "the number of memory blocks for container {} differs from the number of \
             requested resources",
            container.name
        );
        return unsatisfiable;
    }

    let mut hints = unsatisfiable.clone();
    for block in blocks {
        match requested.get(&block.resource) {
            Some(&size) if size == block.size => {}
            Some(&size) => {
                error!(
                    "memory {} already allocated to (pod: {}, container: {}) with a different \
                     size than requested: requested {}, allocated {}",
                    block.resource, pod.uid, container.name, size, block.size
                );
                return unsatisfiable;
            }
            None => {
                error!(
                    "container {} did not request allocated resource {}",
                    container.name, block.resource
                );
                return unsatisfiable;
            }
        }

        let mask = match BitMask::from_nodes(&block.numa_affinity) {
            Ok(mask) => mask,
            Err(err) => {
                error!("failed to rebuild the NUMA affinity mask: {}", err);
                return unsatisfiable;
            }
        };
        debug!(
            "regenerating topology hints, {} was already allocated to (pod: {}, container: {})",
            block.resource, pod.uid, container.name
        );
        if let Some(resource_hints) = hints.get_mut(&block.resource) {
            resource_hints.push(TopologyHint::new(Some(mask), true));
        }
    }
    hints
}

/// First structural difference between two machine states, if any.
fn machine_state_difference(current: &NodeMap, expected: &NodeMap) -> Option<String> {
    if current.len() != expected.len() {
        return Some(format!(
            "node count differs: {} != {}",
            current.len(),
            expected.len()
        ));
    }

    for (node_id, current_node) in current {
        let Some(expected_node) = expected.get(node_id) else {
            return Some(format!("unexpected NUMA node {}", node_id));
        };
        if current_node.assignments != expected_node.assignments {
            return Some(format!(
                "node {} assignment counts differ: {} != {}",
                node_id, current_node.assignments, expected_node.assignments
            ));
        }
        if current_node.group != expected_node.group {
            return Some(format!(
                "node {} groups differ: {:?} != {:?}",
                node_id, current_node.group, expected_node.group
            ));
        }
        if current_node.memory_map.len() != expected_node.memory_map.len() {
            return Some(format!(
                "node {} resource counts differ: {} != {}",
                node_id,
                current_node.memory_map.len(),
                expected_node.memory_map.len()
            ));
        }
        for (resource, current_table) in &current_node.memory_map {
            match expected_node.memory_map.get(resource) {
                None => return Some(format!("node {} has unexpected resource {}", node_id, resource)),
                Some(expected_table) if expected_table != current_table => {
                    return Some(format!(
                        "node {} resource {} differs: {:?} != {:?}",
                        node_id, resource, current_table, expected_table
                    ));
                }
                Some(_) => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{HugePagesInfo, NumaNodeInfo};
    use crate::resources::Quantity;
    use crate::state::MemoryState;

    const GB: u64 = 1 << 30;
    const PAGE_SIZE_1G_KIB: u64 = 1048576;

    fn hugepages_1gi() -> ResourceName {
        ResourceName::hugepages(GB)
    }

    fn two_node_machine() -> MachineInfo {
        MachineInfo {
            nodes: (0..2)
                .map(|id| NumaNodeInfo {
                    id,
                    memory: 128 * GB,
                    hugepages: vec![HugePagesInfo {
                        page_size_kib: PAGE_SIZE_1G_KIB,
                        num_pages: 10,
                    }],
                })
                .collect(),
        }
    }

    fn reserved() -> ReservedMemory {
        let mut reserved = ReservedMemory::new();
        for node in 0..2 {
            reserved
                .entry(node)
                .or_default()
                .insert(ResourceName::memory(), GB);
        }
        reserved
    }

    fn policy() -> StaticPolicy {
        StaticPolicy::new(two_node_machine(), reserved(), Arc::new(AffinityStore::new())).unwrap()
    }

    fn started(policy: &mut StaticPolicy) -> MemoryState {
        let mut state = MemoryState::new();
        policy.start(&mut state).unwrap();
        state
    }

    fn guaranteed_pod(uid: &str, memory: &str) -> Pod {
        Pod::new(uid, uid).with_container(
            Container::new("main")
                .with_guaranteed(ResourceName::cpu(), Quantity::new("1000m"))
                .with_guaranteed(ResourceName::memory(), Quantity::new(memory)),
        )
    }

    fn requested(memory: u64) -> RequestedResources {
        RequestedResources::from([(ResourceName::memory(), memory)])
    }

    #[test]
    fn test_rejects_zero_reserved_memory() {
        let result = StaticPolicy::new(
            two_node_machine(),
            ReservedMemory::new(),
            Arc::new(AffinityStore::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_default_machine_state_accounting() {
        let mut policy = policy();
        let state = started(&mut policy);
        let machine_state = state.machine_state();

        assert_eq!(machine_state.len(), 2);
        for node in machine_state.values() {
            let memory = &node.memory_map[&ResourceName::memory()];
            // 128 GiB total minus 1 GiB reserved minus 10 GiB of hugepages
            assert_eq!(memory.total, 128 * GB);
            assert_eq!(memory.system_reserved, GB);
            assert_eq!(memory.allocatable, 117 * GB);
            assert_eq!(memory.free, 117 * GB);
            assert_eq!(memory.reserved, 0);

            let hugepages = &node.memory_map[&hugepages_1gi()];
            assert_eq!(hugepages.total, 10 * GB);
            assert_eq!(hugepages.allocatable, 10 * GB);

            assert_eq!(node.assignments, 0);
        }
        assert_eq!(machine_state[&0].group, vec![0]);
        assert_eq!(machine_state[&1].group, vec![1]);
    }

    #[test]
    fn test_hints_prefer_minimal_affinity() {
        let mut policy = policy();
        let state = started(&mut policy);

        let hints = policy.calculate_hints(&state.machine_state(), &requested(GB), &[]);
        let memory_hints = &hints[&ResourceName::memory()];
        // {0}, {1} and {0,1} all fit 1 GiB; only the singles are preferred
        assert_eq!(memory_hints.len(), 3);
        for hint in memory_hints {
            let mask = hint.affinity.unwrap();
            assert_eq!(hint.preferred, mask.count() == 1);
        }
    }

    #[test]
    fn test_hints_when_only_multi_node_fits() {
        let mut policy = policy();
        let state = started(&mut policy);

        let hints = policy.calculate_hints(&state.machine_state(), &requested(200 * GB), &[]);
        let memory_hints = &hints[&ResourceName::memory()];
        assert_eq!(memory_hints.len(), 1);
        assert_eq!(memory_hints[0].affinity.unwrap().bits(), vec![0, 1]);
        assert!(memory_hints[0].preferred);
    }

    #[test]
    fn test_hints_skip_infeasible_demand() {
        let mut policy = policy();
        let state = started(&mut policy);

        let hints = policy.calculate_hints(&state.machine_state(), &requested(500 * GB), &[]);
        assert!(hints.is_empty());
    }

    #[test]
    fn test_allocate_reserves_and_remove_restores() {
        let mut policy = policy();
        let mut state = started(&mut policy);
        let before = state.machine_state();

        let pod = guaranteed_pod("pod-1", "1Gi");
        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();

        let after = state.machine_state();
        let memory = &after[&0].memory_map[&ResourceName::memory()];
        assert_eq!(memory.free, 116 * GB);
        assert_eq!(memory.reserved, GB);
        assert_eq!(after[&0].assignments, 1);
        assert_eq!(after[&0].group, vec![0]);

        let blocks = state.memory_blocks("pod-1", "main").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].numa_affinity, vec![0]);
        assert_eq!(blocks[0].size, GB);
        assert_eq!(blocks[0].reused, 0);

        policy.remove_container(&mut state, "pod-1", "main").unwrap();
        assert_eq!(state.machine_state(), before);
        assert!(state.memory_blocks("pod-1", "main").is_none());
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let pod = guaranteed_pod("pod-1", "1Gi");
        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();
        let snapshot = state.machine_state();

        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();
        assert_eq!(state.machine_state(), snapshot);
    }

    #[test]
    fn test_remove_unknown_container_is_noop() {
        let mut policy = policy();
        let mut state = started(&mut policy);
        let snapshot = state.machine_state();

        policy.remove_container(&mut state, "ghost", "main").unwrap();
        assert_eq!(state.machine_state(), snapshot);
    }

    #[test]
    fn test_allocate_extends_across_nodes() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let pod = guaranteed_pod("pod-1", "200Gi");
        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();

        let machine_state = state.machine_state();
        let node0 = &machine_state[&0].memory_map[&ResourceName::memory()];
        let node1 = &machine_state[&1].memory_map[&ResourceName::memory()];
        // node 0 drains completely, node 1 covers the remaining 83 GiB
        assert_eq!(node0.free, 0);
        assert_eq!(node0.reserved, 117 * GB);
        assert_eq!(node1.free, 34 * GB);
        assert_eq!(node1.reserved, 83 * GB);
        assert_eq!(machine_state[&0].group, vec![0, 1]);
        assert_eq!(machine_state[&1].group, vec![0, 1]);
        assert_eq!(machine_state[&0].assignments, 1);
    }

    #[test]
    fn test_allocate_widens_a_narrow_recorded_affinity() {
        let affinity = Arc::new(AffinityStore::new());
        let mut policy =
            StaticPolicy::new(two_node_machine(), reserved(), affinity.clone()).unwrap();
        let mut state = started(&mut policy);

        // the merge recorded a single node that cannot hold the request
        affinity.set(
            "pod-1",
            "main",
            TopologyHint::new(Some(BitMask::from_nodes(&[0]).unwrap()), false),
        );
        let pod = guaranteed_pod("pod-1", "200Gi");
        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();

        let blocks = state.memory_blocks("pod-1", "main").unwrap();
        assert_eq!(blocks[0].numa_affinity, vec![0, 1]);
        let machine_state = state.machine_state();
        assert_eq!(machine_state[&0].group, vec![0, 1]);
        assert_eq!(machine_state[&1].group, vec![0, 1]);
    }

    #[test]
    fn test_allocate_skips_non_guaranteed() {
        let mut policy = policy();
        let mut state = started(&mut policy);
        let snapshot = state.machine_state();

        let pod = Pod::new("pod-1", "pod-1").with_container(
            Container::new("main").with_request(ResourceName::memory(), Quantity::new("1Gi")),
        );
        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();

        assert_eq!(state.machine_state(), snapshot);
        assert!(state.memory_blocks("pod-1", "main").is_none());
        assert!(policy
            .container_hints(&state, &pod, &pod.containers[0])
            .is_empty());
    }

    #[test]
    fn test_allocate_fails_on_invalid_quantity() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let pod = Pod::new("pod-1", "pod-1").with_container(
            Container::new("main").with_guaranteed(ResourceName::memory(), Quantity::new("0.5")),
        );
        let result = policy.allocate(&mut state, &pod, &pod.containers[0]);
        assert!(matches!(result, Err(Error::InvalidQuantity(_))));
    }

    #[test]
    fn test_allocate_fails_when_nothing_fits() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let pod = guaranteed_pod("pod-1", "300Gi");
        let result = policy.allocate(&mut state, &pod, &pod.containers[0]);
        assert!(matches!(result, Err(Error::NoFeasibleHint)));
        // staging: the failed allocation left no trace
        assert_eq!(state.machine_state(), policy.default_machine_state());
    }

    #[test]
    fn test_init_container_reservation_is_reused() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let pod = Pod::new("pod-1", "pod-1")
            .with_init_container(
                Container::new("init")
                    .with_guaranteed(ResourceName::memory(), Quantity::new("2Gi")),
            )
            .with_container(
                Container::new("main")
                    .with_guaranteed(ResourceName::memory(), Quantity::new("1Gi")),
            );

        policy
            .allocate(&mut state, &pod, &pod.init_containers[0])
            .unwrap();
        let after_init = state.machine_state();

        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();

        // the app container consumed nothing beyond the init reservation
        assert_eq!(state.machine_state()[&0].memory_map[&ResourceName::memory()].free,
            after_init[&0].memory_map[&ResourceName::memory()].free);
        let blocks = state.memory_blocks("pod-1", "main").unwrap();
        assert_eq!(blocks[0].size, 0);
        assert_eq!(blocks[0].reused, GB);
        // assignments still track both containers
        assert_eq!(state.machine_state()[&0].assignments, 2);
    }

    #[test]
    fn test_reusable_pool_dropped_for_other_pod() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let first = Pod::new("pod-1", "pod-1").with_init_container(
            Container::new("init").with_guaranteed(ResourceName::memory(), Quantity::new("2Gi")),
        );
        policy
            .allocate(&mut state, &first, &first.init_containers[0])
            .unwrap();
        assert!(policy.memory_to_reuse.contains_key("pod-1"));

        let second = guaranteed_pod("pod-2", "1Gi");
        policy
            .allocate(&mut state, &second, &second.containers[0])
            .unwrap();
        assert!(!policy.memory_to_reuse.contains_key("pod-1"));

        // pod-2's container was an app container, so it consumed real bytes
        let blocks = state.memory_blocks("pod-2", "main").unwrap();
        assert_eq!(blocks[0].size, GB);
    }

    #[test]
    fn test_grouped_nodes_reject_single_numa_hints() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        // a 200 GiB pod groups both nodes
        let big = guaranteed_pod("pod-big", "200Gi");
        policy
            .allocate(&mut state, &big, &big.containers[0])
            .unwrap();

        let hints = policy.calculate_hints(&state.machine_state(), &requested(GB), &[]);
        let memory_hints = &hints[&ResourceName::memory()];
        // singles are gone, only the exact group remains
        assert_eq!(memory_hints.len(), 1);
        assert_eq!(memory_hints[0].affinity.unwrap().bits(), vec![0, 1]);
    }

    #[test]
    fn test_single_numa_assignment_blocks_multi_node_masks() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let small = guaranteed_pod("pod-small", "1Gi");
        policy
            .allocate(&mut state, &small, &small.containers[0])
            .unwrap();

        // node 0 serves a single-NUMA assignment, so {0,1} is off limits
        // while {0} and {1} still work
        let hints = policy.calculate_hints(&state.machine_state(), &requested(GB), &[]);
        let masks: Vec<Vec<usize>> = hints[&ResourceName::memory()]
            .iter()
            .map(|hint| hint.affinity.unwrap().bits())
            .collect();
        assert_eq!(masks, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_pod_level_aggregation() {
        let pod = Pod::new("pod-1", "pod-1")
            .with_init_container(
                Container::new("init-a")
                    .with_guaranteed(ResourceName::memory(), Quantity::new("3Gi")),
            )
            .with_init_container(
                Container::new("init-b")
                    .with_guaranteed(ResourceName::memory(), Quantity::new("2Gi")),
            )
            .with_container(
                Container::new("app-a")
                    .with_guaranteed(ResourceName::memory(), Quantity::new("1Gi")),
            )
            .with_container(
                Container::new("app-b")
                    .with_guaranteed(ResourceName::memory(), Quantity::new("1Gi")),
            );

        // max(1 + 1, max(3, 2)) = 3 GiB
        let requested = pod_requested_resources(&pod).unwrap();
        assert_eq!(requested[&ResourceName::memory()], 3 * GB);
    }

    #[test]
    fn test_regenerate_hints_from_blocks() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let pod = guaranteed_pod("pod-1", "1Gi");
        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();

        let hints = policy.container_hints(&state, &pod, &pod.containers[0]);
        let memory_hints = &hints[&ResourceName::memory()];
        assert_eq!(memory_hints.len(), 1);
        assert!(memory_hints[0].preferred);
        assert_eq!(memory_hints[0].affinity.unwrap().bits(), vec![0]);
    }

    #[test]
    fn test_regenerate_rejects_size_mismatch() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let pod = guaranteed_pod("pod-1", "1Gi");
        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();

        // the same container comes back asking for more
        let grown = guaranteed_pod("pod-1", "2Gi");
        let hints = policy.container_hints(&state, &grown, &grown.containers[0]);
        assert_eq!(hints[&ResourceName::memory()], Vec::new());
    }

    #[test]
    fn test_validate_rejects_assignments_without_machine_state() {
        let mut policy = policy();
        let mut state = MemoryState::new();
        state.set_memory_blocks(
            "pod-1",
            "main",
            vec![Block {
                numa_affinity: vec![0],
                resource: ResourceName::memory(),
                size: GB,
                reused: 0,
            }],
        );

        assert!(matches!(
            policy.start(&mut state),
            Err(Error::CorruptCheckpoint(_))
        ));
    }

    #[test]
    fn test_validate_detects_drift() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let pod = guaranteed_pod("pod-1", "1Gi");
        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();

        // a restart with consistent state passes
        assert!(policy.start(&mut state).is_ok());

        // one byte of disagreement fails
        let mut machine_state = state.machine_state();
        machine_state
            .get_mut(&0)
            .unwrap()
            .memory_map
            .get_mut(&ResourceName::memory())
            .unwrap()
            .free += 1;
        state.set_machine_state(machine_state);
        assert!(matches!(
            policy.start(&mut state),
            Err(Error::TopologyDrift(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_node_in_blocks() {
        let mut policy = policy();
        let mut state = started(&mut policy);
        state.set_memory_blocks(
            "pod-1",
            "main",
            vec![Block {
                numa_affinity: vec![7],
                resource: ResourceName::memory(),
                size: GB,
                reused: 0,
            }],
        );

        assert!(matches!(
            policy.start(&mut state),
            Err(Error::CorruptCheckpoint(_))
        ));
    }

    #[test]
    fn test_pod_hints_regenerate_after_restart() {
        let mut policy = policy();
        let mut state = started(&mut policy);

        let pod = guaranteed_pod("pod-1", "1Gi");
        policy
            .allocate(&mut state, &pod, &pod.containers[0])
            .unwrap();

        let hints = policy.pod_hints(&state, &pod);
        let memory_hints = &hints[&ResourceName::memory()];
        assert_eq!(memory_hints.len(), 1);
        assert!(memory_hints[0].preferred);
    }
}
