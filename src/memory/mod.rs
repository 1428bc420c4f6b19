//! Memory placement policies.
//!
//! A policy decides where a container's memory lands and keeps the
//! per-node accounting honest. The `static` policy is the only one doing
//! real work; `none` exists so the manager can be wired up with placement
//! disabled.

pub mod policy_static;

pub use policy_static::StaticPolicy;

use crate::error::Result;
use crate::pod::{Container, Pod};
use crate::state::StateStore;
use crate::topology::HintsMap;

/// A memory placement policy driven by the manager.
pub trait Policy: Send {
    fn name(&self) -> &'static str;

    /// Validate or initialize persisted state before serving traffic.
    fn start(&mut self, state: &mut dyn StateStore) -> Result<()>;

    /// Reserve memory for one container of an admitted pod.
    fn allocate(&mut self, state: &mut dyn StateStore, pod: &Pod, container: &Container)
        -> Result<()>;

    /// Release one container's reservations.
    fn remove_container(
        &mut self,
        state: &mut dyn StateStore,
        pod_uid: &str,
        container_name: &str,
    ) -> Result<()>;

    /// Topology hints for one container.
    fn container_hints(&self, state: &dyn StateStore, pod: &Pod, container: &Container)
        -> HintsMap;

    /// Pod-level topology hints.
    fn pod_hints(&self, state: &dyn StateStore, pod: &Pod) -> HintsMap;
}

/// Placement disabled: no hints, no reservations.
#[derive(Debug, Default)]
pub struct NonePolicy;

impl NonePolicy {
    pub fn new() -> Self {
        NonePolicy
    }
}

impl Policy for NonePolicy {
    fn name(&self) -> &'static str {
        "none"
    }

    fn start(&mut self, _state: &mut dyn StateStore) -> Result<()> {
        Ok(())
    }

    fn allocate(
        &mut self,
        _state: &mut dyn StateStore,
        _pod: &Pod,
        _container: &Container,
    ) -> Result<()> {
        Ok(())
    }

    fn remove_container(
        &mut self,
        _state: &mut dyn StateStore,
        _pod_uid: &str,
        _container_name: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn container_hints(
        &self,
        _state: &dyn StateStore,
        _pod: &Pod,
        _container: &Container,
    ) -> HintsMap {
        HintsMap::new()
    }

    fn pod_hints(&self, _state: &dyn StateStore, _pod: &Pod) -> HintsMap {
        HintsMap::new()
    }
}
