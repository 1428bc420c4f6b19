//! Admission scopes: per-container and per-pod hint reconciliation.

use super::{AffinityStore, HintProvider, HintsMap, TopologyPolicy};
use crate::config::{TopologyPolicyKind, TopologyScopeKind};
use crate::error::{Error, Result};
use crate::pod::{Container, Pod};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "telemetry")]
use crate::telemetry::Metrics;
#[cfg(feature = "telemetry")]
use std::time::Instant;

/// Why a pod was denied admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The topology policy found no acceptable common affinity.
    TopologyAffinity,
    /// A hint provider failed to allocate after the policy admitted.
    UnexpectedAdmission,
}

impl DenyReason {
    /// Stable reason code surfaced to the caller.
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::TopologyAffinity => "TopologyAffinityError",
            DenyReason::UnexpectedAdmission => "UnexpectedAdmissionError",
        }
    }
}

/// Outcome of one pod admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitResult {
    Admit,
    Deny { reason: DenyReason, message: String },
}

impl AdmitResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmitResult::Admit)
    }

    fn topology_affinity_error() -> Self {
        AdmitResult::Deny {
            reason: DenyReason::TopologyAffinity,
            message: "resources cannot be allocated with NUMA locality".to_string(),
        }
    }

    fn unexpected_admission_error(err: Error) -> Self {
        AdmitResult::Deny {
            reason: DenyReason::UnexpectedAdmission,
            message: format!("allocation failed: {}", err),
        }
    }
}

/// Drives admission: gathers hints from every provider, merges them under
/// the configured policy, records the chosen affinity and invokes
/// allocation.
pub struct Scope {
    kind: TopologyScopeKind,
    policy: TopologyPolicy,
    providers: Vec<Arc<dyn HintProvider>>,
    affinity: Arc<AffinityStore>,
    /// container id -> (pod uid, container name)
    pod_map: Mutex<HashMap<String, (String, String)>>,
    #[cfg(feature = "telemetry")]
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("kind", &self.kind)
            .field("policy", &self.policy.name())
            .field("providers", &self.providers.len())
            .finish_non_exhaustive()
    }
}

impl Scope {
    pub fn new(kind: TopologyScopeKind, policy: TopologyPolicy, affinity: Arc<AffinityStore>) -> Self {
        Scope {
            kind,
            policy,
            providers: Vec::new(),
            affinity,
            pod_map: Mutex::new(HashMap::new()),
            #[cfg(feature = "telemetry")]
            metrics: None,
        }
    }

    pub fn kind(&self) -> TopologyScopeKind {
        self.kind
    }

    /// Register a hint provider consulted on every admission.
    pub fn add_hint_provider(&mut self, provider: Arc<dyn HintProvider>) {
        self.providers.push(provider);
    }

    /// Record admission metrics on this collector.
    #[cfg(feature = "telemetry")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The affinity table shared with hint providers.
    pub fn affinity_store(&self) -> &Arc<AffinityStore> {
        &self.affinity
    }

    /// Admit or deny one pod.
    pub fn admit(&self, pod: &Pod) -> AdmitResult {
        #[cfg(feature = "telemetry")]
        let started = Instant::now();

        let result = self.admit_inner(pod);

        #[cfg(feature = "telemetry")]
        if let Some(metrics) = &self.metrics {
            metrics.record_admission(result.is_admitted(), started.elapsed());
        }
        result
    }

    fn admit_inner(&self, pod: &Pod) -> AdmitResult {
        if self.policy.kind() == TopologyPolicyKind::None {
            return self.admit_policy_none(pod);
        }

        match self.kind {
            TopologyScopeKind::Container => {
                for container in pod.all_containers() {
                    let providers_hints = self.accumulate_container_hints(pod, container);
                    let (hint, admit) = self.policy.merge(&providers_hints);
                    debug!(
                        "topology affinity for pod {:?} container {:?}: {}",
                        pod.name, container.name, hint
                    );
                    if !admit {
                        return AdmitResult::topology_affinity_error();
                    }
                    self.affinity.set(&pod.uid, &container.name, hint);
                    if let Err(err) = self.allocate_aligned(pod, container) {
                        return AdmitResult::unexpected_admission_error(err);
                    }
                }
            }
            TopologyScopeKind::Pod => {
                let providers_hints = self.accumulate_pod_hints(pod);
                let (hint, admit) = self.policy.merge(&providers_hints);
                debug!("topology affinity for pod {:?}: {}", pod.name, hint);
                if !admit {
                    return AdmitResult::topology_affinity_error();
                }
                for container in pod.all_containers() {
                    self.affinity.set(&pod.uid, &container.name, hint);
                    if let Err(err) = self.allocate_aligned(pod, container) {
                        return AdmitResult::unexpected_admission_error(err);
                    }
                }
            }
        }
        AdmitResult::Admit
    }

    /// The `none` policy skips the merge entirely but still lets every
    /// provider reserve resources.
    fn admit_policy_none(&self, pod: &Pod) -> AdmitResult {
        for container in pod.all_containers() {
            if let Err(err) = self.allocate_aligned(pod, container) {
                return AdmitResult::unexpected_admission_error(err);
            }
        }
        AdmitResult::Admit
    }

    fn accumulate_container_hints(&self, pod: &Pod, container: &Container) -> Vec<HintsMap> {
        self.providers
            .iter()
            .map(|provider| provider.container_hints(pod, container))
            .collect()
    }

    fn accumulate_pod_hints(&self, pod: &Pod) -> Vec<HintsMap> {
        self.providers
            .iter()
            .map(|provider| provider.pod_hints(pod))
            .collect()
    }

    fn allocate_aligned(&self, pod: &Pod, container: &Container) -> Result<()> {
        for provider in &self.providers {
            provider.allocate(pod, container)?;
        }
        Ok(())
    }

    /// Bind a running container id to its pod and container name.
    pub fn add_container(&self, pod: &Pod, container_name: &str, container_id: &str) {
        self.pod_map.lock().insert(
            container_id.to_string(),
            (pod.uid.clone(), container_name.to_string()),
        );
    }

    /// Forget a container id and its affinity entry. Idempotent and silent
    /// for unknown ids.
    pub fn remove_container(&self, container_id: &str) {
        let removed = self.pod_map.lock().remove(container_id);
        if let Some((pod_uid, container_name)) = removed {
            info!("removing container {:?} of pod {}", container_name, pod_uid);
            self.affinity.remove_container(&pod_uid, &container_name);
        }
    }
}
