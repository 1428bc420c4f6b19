//! Merge strategies over per-resource hint lists.

use super::{HintsMap, TopologyHint};
use crate::bitmask::BitMask;
use crate::config::TopologyPolicyKind;
use crate::error::Result;
use log::debug;

/// Merge engine for one of the four topology policies.
///
/// Constructed once per scope from the policy kind and the host's NUMA
/// node ids; `merge` is a pure function of the providers' hints.
#[derive(Debug, Clone)]
pub struct TopologyPolicy {
    kind: TopologyPolicyKind,
    all_nodes: BitMask,
}

impl TopologyPolicy {
    pub fn new(kind: TopologyPolicyKind, numa_nodes: &[usize]) -> Result<Self> {
        Ok(TopologyPolicy {
            kind,
            all_nodes: BitMask::from_nodes(numa_nodes)?,
        })
    }

    pub fn kind(&self) -> TopologyPolicyKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Merge all providers' hints into the best common hint and decide
    /// whether the pod may be admitted under this policy.
    pub fn merge(&self, providers_hints: &[HintsMap]) -> (TopologyHint, bool) {
        if self.kind == TopologyPolicyKind::None {
            return (TopologyHint::default(), true);
        }

        let mut components = filter_providers_hints(providers_hints);
        if self.kind == TopologyPolicyKind::SingleNumaNode {
            components = filter_single_numa_hints(components);
        }

        let mut best = self.best_combination(&components);

        // A merged affinity spanning every node carries no locality
        // constraint; the single-NUMA policy reads it as "no preference"
        // rather than as an N-node placement.
        if self.kind == TopologyPolicyKind::SingleNumaNode && best.affinity == Some(self.all_nodes)
        {
            best.affinity = None;
        }

        let admit = match self.kind {
            TopologyPolicyKind::None => true,
            TopologyPolicyKind::BestEffort => true,
            TopologyPolicyKind::Restricted => best.preferred,
            TopologyPolicyKind::SingleNumaNode => {
                best.preferred && best.affinity.map_or(true, |mask| mask.count() == 1)
            }
        };
        (best, admit)
    }

    /// Walk the cross product of one hint per (provider, resource) and keep
    /// the best viable merge.
    fn best_combination(&self, components: &[Vec<TopologyHint>]) -> TopologyHint {
        let mut best: Option<TopologyHint> = None;
        let mut combination = Vec::with_capacity(components.len());
        self.walk_combinations(components, &mut combination, &mut |merged| {
            let replace = match best {
                None => true,
                Some(current) => {
                    (merged.preferred && !current.preferred)
                        || (merged.preferred == current.preferred
                            && narrower(merged.affinity, current.affinity))
                }
            };
            if replace {
                best = Some(merged);
            }
        });
        best.unwrap_or_default()
    }

    fn walk_combinations<F>(
        &self,
        components: &[Vec<TopologyHint>],
        combination: &mut Vec<TopologyHint>,
        visit: &mut F,
    ) where
        F: FnMut(TopologyHint),
    {
        if combination.len() == components.len() {
            if let Some(merged) = self.merge_combination(combination) {
                visit(merged);
            }
            return;
        }
        for hint in &components[combination.len()] {
            combination.push(*hint);
            self.walk_combinations(components, combination, visit);
            combination.pop();
        }
    }

    /// Intersect one combination. `None` components mean "all nodes"; an
    /// empty intersection is not a viable placement.
    fn merge_combination(&self, combination: &[TopologyHint]) -> Option<TopologyHint> {
        let mut affinity = self.all_nodes;
        let mut preferred = true;
        for hint in combination {
            if let Some(mask) = hint.affinity {
                affinity = affinity.and(mask);
            }
            if !hint.preferred {
                preferred = false;
            }
        }
        if affinity.is_empty() {
            return None;
        }
        Some(TopologyHint::new(Some(affinity), preferred))
    }
}

fn narrower(a: Option<BitMask>, b: Option<BitMask>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.is_narrower_than(b),
        // any concrete mask beats no preference
        (Some(_), None) => true,
        _ => false,
    }
}

/// Flatten providers' maps into one hint list per (provider, resource).
///
/// A provider with no hints at all has no preference; a provider reporting
/// an empty list for a resource cannot satisfy it and poisons every merge
/// with `preferred = false`.
fn filter_providers_hints(providers_hints: &[HintsMap]) -> Vec<Vec<TopologyHint>> {
    let mut components = Vec::new();
    for hints in providers_hints {
        if hints.is_empty() {
            components.push(vec![TopologyHint::new(None, true)]);
            continue;
        }
        for (resource, resource_hints) in hints {
            if resource_hints.is_empty() {
                debug!("provider reported no viable hints for {}", resource);
                components.push(vec![TopologyHint::new(None, false)]);
            } else {
                components.push(resource_hints.clone());
            }
        }
    }
    components
}

/// Keep only hints a single-NUMA placement could honor.
fn filter_single_numa_hints(components: Vec<Vec<TopologyHint>>) -> Vec<Vec<TopologyHint>> {
    components
        .into_iter()
        .map(|hints| {
            hints
                .into_iter()
                .filter(|hint| hint.affinity.map_or(true, |mask| mask.count() == 1))
                .collect()
        })
        .collect()
}
