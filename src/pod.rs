//! Workload model: pods, containers and their resource requirements.

use crate::resources::{Quantity, ResourceName};
use std::collections::BTreeMap;

/// Requested and limited amounts per resource class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRequirements {
    pub requests: BTreeMap<ResourceName, Quantity>,
    pub limits: BTreeMap<ResourceName, Quantity>,
}

/// One container of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub resources: ResourceRequirements,
}

impl Container {
    /// Create a container with no resource requirements.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Container {
            name: name.into(),
            resources: ResourceRequirements::default(),
        }
    }

    /// Add a request for a resource.
    pub fn with_request(mut self, resource: ResourceName, quantity: Quantity) -> Self {
        self.resources.requests.insert(resource, quantity);
        self
    }

    /// Add a limit for a resource.
    pub fn with_limit(mut self, resource: ResourceName, quantity: Quantity) -> Self {
        self.resources.limits.insert(resource, quantity);
        self
    }

    /// Add a resource with request equal to limit (the Guaranteed shape).
    pub fn with_guaranteed(self, resource: ResourceName, quantity: Quantity) -> Self {
        self.with_request(resource.clone(), quantity.clone())
            .with_limit(resource, quantity)
    }
}

/// Quality-of-service class derived from a pod's resource shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosClass {
    /// Every container sets requests equal to limits for every resource.
    Guaranteed,
    /// Some requests or limits are set, but not the Guaranteed shape.
    Burstable,
    /// No container requests or limits anything.
    BestEffort,
}

/// A workload unit about to be placed on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
}

impl Pod {
    /// Create an empty pod.
    pub fn new<U: Into<String>, N: Into<String>>(uid: U, name: N) -> Self {
        Pod {
            uid: uid.into(),
            name: name.into(),
            init_containers: Vec::new(),
            containers: Vec::new(),
        }
    }

    /// Append an app container.
    pub fn with_container(mut self, container: Container) -> Self {
        self.containers.push(container);
        self
    }

    /// Append an init container.
    pub fn with_init_container(mut self, container: Container) -> Self {
        self.init_containers.push(container);
        self
    }

    /// All containers in admission order: init containers first, then app
    /// containers.
    pub fn all_containers(&self) -> impl Iterator<Item = &Container> {
        self.init_containers.iter().chain(self.containers.iter())
    }

    /// Whether the named container is one of the pod's init containers.
    pub fn is_init_container(&self, container_name: &str) -> bool {
        self.init_containers.iter().any(|c| c.name == container_name)
    }

    /// Derive the pod's quality-of-service class from its resource shape.
    pub fn qos_class(&self) -> QosClass {
        let mut requested_anything = false;
        let mut guaranteed = true;

        for container in self.all_containers() {
            let requests = &container.resources.requests;
            let limits = &container.resources.limits;

            if requests.is_empty() && limits.is_empty() {
                guaranteed = false;
                continue;
            }
            requested_anything = true;

            if requests.is_empty() || requests.len() != limits.len() {
                guaranteed = false;
                continue;
            }
            for (resource, quantity) in requests {
                if limits.get(resource) != Some(quantity) {
                    guaranteed = false;
                }
            }
        }

        if !requested_anything {
            QosClass::BestEffort
        } else if guaranteed {
            QosClass::Guaranteed
        } else {
            QosClass::Burstable
        }
    }
}
