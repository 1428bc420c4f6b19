//! Convenient re-exports for common admission-core types.
//!
//! This module provides a single import for most use cases:
//! ```
//! use numalign::prelude::*;
//! ```

pub use crate::bitmask::BitMask;
pub use crate::config::{
    Config, ConfigBuilder, MemoryPolicyKind, TopologyPolicyKind, TopologyScopeKind,
};
pub use crate::error::{Error, Result};
pub use crate::machine::{HugePagesInfo, MachineInfo, NumaNodeInfo};
pub use crate::manager::MemoryManager;
pub use crate::pod::{Container, Pod, QosClass};
pub use crate::resources::{Quantity, ResourceName};
pub use crate::state::{Block, MemoryState, StateStore};
pub use crate::topology::{
    AdmitResult, AffinityStore, DenyReason, HintProvider, Scope, TopologyHint, TopologyPolicy,
};
