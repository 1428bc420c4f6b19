//! NUMALIGN - NUMA-aware resource alignment and admission.
//!
//! A node-agent core that decides, for each workload unit about to be
//! placed on a multi-socket host, which NUMA nodes back its memory so that
//! memory, hugepages and other locality-sensitive resources stay
//! co-aligned.
//!
//! Two halves cooperate:
//!
//! - **Topology-hint reconciliation**: hint providers report per-resource
//!   locality preferences, a [`TopologyPolicy`](topology::TopologyPolicy)
//!   merges them by set intersection and a [`Scope`](topology::Scope)
//!   turns the result into an admit or deny decision.
//! - **Static memory placement**: the
//!   [`StaticPolicy`](memory::StaticPolicy) hint provider tracks per-node
//!   free and reserved memory for every memory class, reserves blocks when
//!   a container is admitted and releases them when it goes away.
//!
//! # Quick Start
//!
//! ```
//! # fn main() -> numalign::Result<()> {
//! use std::sync::Arc;
//! use numalign::config::{Config, MemoryPolicyKind, TopologyPolicyKind, TopologyScopeKind};
//! use numalign::machine::{MachineInfo, NumaNodeInfo};
//! use numalign::manager::MemoryManager;
//! use numalign::pod::{Container, Pod};
//! use numalign::resources::{Quantity, ResourceName};
//! use numalign::state::MemoryState;
//! use numalign::topology::{AffinityStore, Scope, TopologyPolicy};
//!
//! let machine_info = MachineInfo {
//!     nodes: (0..2)
//!         .map(|id| NumaNodeInfo { id, memory: 8 << 30, hugepages: vec![] })
//!         .collect(),
//! };
//!
//! let config = Config::builder()
//!     .topology_scope(TopologyScopeKind::Container)
//!     .topology_policy(TopologyPolicyKind::Restricted)
//!     .memory_policy(MemoryPolicyKind::Static)
//!     .reserve(0, ResourceName::memory(), 1 << 30)
//!     .reserve(1, ResourceName::memory(), 1 << 30)
//!     .build()?;
//!
//! let affinity = Arc::new(AffinityStore::new());
//! let manager = Arc::new(MemoryManager::new(
//!     &config,
//!     machine_info.clone(),
//!     affinity.clone(),
//!     Box::new(MemoryState::new()),
//! )?);
//! manager.start()?;
//!
//! let policy = TopologyPolicy::new(config.topology_policy, &machine_info.node_ids())?;
//! let mut scope = Scope::new(config.topology_scope, policy, affinity);
//! scope.add_hint_provider(manager.clone());
//!
//! let pod = Pod::new("pod-uid", "demo").with_container(
//!     Container::new("main").with_guaranteed(ResourceName::memory(), Quantity::new("1Gi")),
//! );
//! assert!(scope.admit(&pod).is_admitted());
//! # Ok(())
//! # }
//! ```
//!
//! # Design
//!
//! - All placement state lives behind one manager-level mutex; operations
//!   are short, synchronous and CPU-bound.
//! - Subset enumeration and every map iteration are deterministic, so
//!   policy merges are reproducible regardless of provider order.
//! - Machine state is mutated on a local clone and committed only on
//!   success; a failed allocation leaves no trace.

#![warn(missing_debug_implementations)]

pub mod bitmask;
pub mod config;
pub mod error;
pub mod machine;
pub mod manager;
pub mod memory;
pub mod pod;
pub mod prelude;
pub mod resources;
pub mod runtime;
pub mod state;
pub mod topology;

#[cfg(feature = "telemetry")]
pub mod telemetry;

// Re-export key types at crate root
pub use config::{Config, ConfigBuilder, MemoryPolicyKind, TopologyPolicyKind, TopologyScopeKind};
pub use error::{Error, Result};
pub use manager::MemoryManager;
pub use topology::{AdmitResult, Scope, TopologyHint};
