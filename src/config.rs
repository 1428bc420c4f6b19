use crate::error::{Error, Result};
use crate::resources::ResourceName;
use crate::state::NodeId;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Grouping level at which topology hints are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyScopeKind {
    /// Merge hints independently for every container.
    #[default]
    Container,
    /// Merge one pod-level hint and apply it to every container.
    Pod,
}

impl TopologyScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopologyScopeKind::Container => "container",
            TopologyScopeKind::Pod => "pod",
        }
    }
}

impl fmt::Display for TopologyScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopologyScopeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "container" => Ok(TopologyScopeKind::Container),
            "pod" => Ok(TopologyScopeKind::Pod),
            _ => Err(Error::config(format!("unknown topology scope {:?}", s))),
        }
    }
}

/// Merge strategy applied to provider hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyPolicyKind {
    /// Admit everything, merge nothing.
    #[default]
    None,
    /// Prefer aligned placement but admit regardless.
    BestEffort,
    /// Admit only when the merged hint is preferred.
    Restricted,
    /// Admit only when the merged hint is preferred and fits one node.
    SingleNumaNode,
}

impl TopologyPolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopologyPolicyKind::None => "none",
            TopologyPolicyKind::BestEffort => "best-effort",
            TopologyPolicyKind::Restricted => "restricted",
            TopologyPolicyKind::SingleNumaNode => "single-numa-node",
        }
    }
}

impl fmt::Display for TopologyPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopologyPolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(TopologyPolicyKind::None),
            "best-effort" => Ok(TopologyPolicyKind::BestEffort),
            "restricted" => Ok(TopologyPolicyKind::Restricted),
            "single-numa-node" => Ok(TopologyPolicyKind::SingleNumaNode),
            _ => Err(Error::config(format!("unknown topology policy {:?}", s))),
        }
    }
}

/// Memory placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryPolicyKind {
    /// No memory pinning.
    #[default]
    None,
    /// Static NUMA-aware placement for Guaranteed pods.
    Static,
}

impl MemoryPolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryPolicyKind::None => "none",
            MemoryPolicyKind::Static => "static",
        }
    }
}

impl fmt::Display for MemoryPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryPolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(MemoryPolicyKind::None),
            "static" => Ok(MemoryPolicyKind::Static),
            _ => Err(Error::config(format!("unknown memory policy {:?}", s))),
        }
    }
}

/// Bytes reserved for the system, per NUMA node and resource class.
pub type ReservedMemory = BTreeMap<NodeId, BTreeMap<ResourceName, u64>>;

/// Admission-core configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub topology_scope: TopologyScopeKind,
    pub topology_policy: TopologyPolicyKind,
    pub memory_policy: MemoryPolicyKind,
    pub reserved_memory: ReservedMemory,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_policy == MemoryPolicyKind::Static {
            let total: u64 = self
                .reserved_memory
                .values()
                .filter_map(|node| node.get(&ResourceName::memory()))
                .sum();
            if total == 0 {
                return Err(Error::config(
                    "the static memory policy requires non-zero system-reserved memory",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    pub fn topology_scope(mut self, scope: TopologyScopeKind) -> Self {
        self.config.topology_scope = scope;
        self
    }

    pub fn topology_policy(mut self, policy: TopologyPolicyKind) -> Self {
        self.config.topology_policy = policy;
        self
    }

    pub fn memory_policy(mut self, policy: MemoryPolicyKind) -> Self {
        self.config.memory_policy = policy;
        self
    }

    /// Reserve bytes of a resource class for the system on one node.
    pub fn reserve(mut self, node: NodeId, resource: ResourceName, bytes: u64) -> Self {
        self.config
            .reserved_memory
            .entry(node)
            .or_default()
            .insert(resource, bytes);
        self
    }

    pub fn reserved_memory(mut self, reserved: ReservedMemory) -> Self {
        self.config.reserved_memory = reserved;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_round_trip() {
        for kind in [
            TopologyPolicyKind::None,
            TopologyPolicyKind::BestEffort,
            TopologyPolicyKind::Restricted,
            TopologyPolicyKind::SingleNumaNode,
        ] {
            assert_eq!(kind.as_str().parse::<TopologyPolicyKind>().unwrap(), kind);
        }
        assert_eq!(
            "pod".parse::<TopologyScopeKind>().unwrap(),
            TopologyScopeKind::Pod
        );
        assert_eq!(
            "static".parse::<MemoryPolicyKind>().unwrap(),
            MemoryPolicyKind::Static
        );
        assert!("fair".parse::<TopologyPolicyKind>().is_err());
    }

    #[test]
    fn test_static_requires_reserved_memory() {
        let err = Config::builder()
            .memory_policy(MemoryPolicyKind::Static)
            .build();
        assert!(err.is_err());

        let ok = Config::builder()
            .memory_policy(MemoryPolicyKind::Static)
            .reserve(0, ResourceName::memory(), 1 << 30)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_none_policy_needs_no_reservation() {
        assert!(Config::builder().build().is_ok());
    }
}
