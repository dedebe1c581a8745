//! Polymorphic handling of the three interceptable workload kinds
//!
//! Deployments, ReplicaSets and StatefulSets share the pod-template
//! substructure the mutation engine edits. [`Workload`] is the tagged sum
//! over the three; every action reaches the containers exclusively through
//! its accessors, so nothing else in the engine needs to know which kind it
//! is operating on. All fields the engine does not touch ride along opaquely
//! in the underlying `k8s-openapi` structs.

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{Error, Result};

/// A Kubernetes workload the engine can inject a traffic-agent into.
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    /// An `apps/v1` Deployment
    Deployment(Deployment),
    /// An `apps/v1` ReplicaSet
    ReplicaSet(ReplicaSet),
    /// An `apps/v1` StatefulSet
    StatefulSet(StatefulSet),
}

impl Workload {
    /// Lower-case kind, as used in log lines and explain strings.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deployment(_) => "deployment",
            Self::ReplicaSet(_) => "replicaset",
            Self::StatefulSet(_) => "statefulset",
        }
    }

    /// The object's name, or an empty string when unset.
    pub fn name(&self) -> String {
        self.metadata().name.clone().unwrap_or_default()
    }

    /// The object's namespace, or an empty string when unset.
    pub fn namespace(&self) -> String {
        self.metadata().namespace.clone().unwrap_or_default()
    }

    /// Shared view of the object's metadata.
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(d) => &d.metadata,
            Self::ReplicaSet(r) => &r.metadata,
            Self::StatefulSet(s) => &s.metadata,
        }
    }

    /// Mutable view of the object's metadata.
    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Deployment(d) => &mut d.metadata,
            Self::ReplicaSet(r) => &mut r.metadata,
            Self::StatefulSet(s) => &mut s.metadata,
        }
    }

    /// The pod template, when the object carries a spec.
    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Self::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
            Self::ReplicaSet(r) => r.spec.as_ref().and_then(|s| s.template.as_ref()),
            Self::StatefulSet(s) => s.spec.as_ref().map(|s| &s.template),
        }
    }

    /// Mutable pod template; fails when the object has no spec.
    ///
    /// Every action mutates the workload exclusively through this accessor.
    pub fn pod_template_mut(&mut self) -> Result<&mut PodTemplateSpec> {
        let name = self.name();
        let kind = self.kind();
        let template = match self {
            Self::Deployment(d) => d.spec.as_mut().map(|s| &mut s.template),
            Self::ReplicaSet(r) => r.spec.as_mut().and_then(|s| s.template.as_mut()),
            Self::StatefulSet(s) => s.spec.as_mut().map(|s| &mut s.template),
        };
        template.ok_or_else(|| {
            Error::no_acceptable(format!("{kind} {name} has no pod template"))
        })
    }

    /// The pod template's containers, or an empty slice when absent.
    pub fn containers(&self) -> &[Container] {
        self.pod_template()
            .and_then(|t| t.spec.as_ref())
            .map(|s| s.containers.as_slice())
            .unwrap_or(&[])
    }

    /// Mutable container list; fails when the object has no pod spec.
    pub fn containers_mut(&mut self) -> Result<&mut Vec<Container>> {
        let name = self.name();
        let kind = self.kind();
        self.pod_template_mut()?
            .spec
            .as_mut()
            .map(|s| &mut s.containers)
            .ok_or_else(|| Error::no_acceptable(format!("{kind} {name} has no pod spec")))
    }

    /// Look up an annotation on the object.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Set an annotation, creating the annotation map if needed.
    pub fn set_annotation(&mut self, key: &str, value: String) {
        self.metadata_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value);
    }

    /// Remove an annotation, returning its previous value.
    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        let meta = self.metadata_mut();
        let removed = meta.annotations.as_mut()?.remove(key);
        if meta.annotations.as_ref().is_some_and(|a| a.is_empty()) {
            meta.annotations = None;
        }
        removed
    }

    /// Whether the workload's latest generation has rolled out and is ready.
    ///
    /// Mirrors the generation/replica arithmetic of `kubectl rollout status`
    /// for each kind. A workload without status is never ready.
    pub fn rollout_ready(&self) -> bool {
        match self {
            Self::Deployment(d) => {
                let Some(status) = &d.status else { return false };
                if status.observed_generation.unwrap_or(0) < d.metadata.generation.unwrap_or(0) {
                    return false;
                }
                let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                status.updated_replicas.unwrap_or(0) >= desired
                    && status.ready_replicas.unwrap_or(0) >= desired
                    && status.unavailable_replicas.unwrap_or(0) == 0
            }
            Self::ReplicaSet(r) => {
                let Some(status) = &r.status else { return false };
                if status.observed_generation.unwrap_or(0) < r.metadata.generation.unwrap_or(0) {
                    return false;
                }
                let desired = r.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                status.ready_replicas.unwrap_or(0) >= desired
            }
            Self::StatefulSet(s) => {
                let Some(status) = &s.status else { return false };
                if status.observed_generation.unwrap_or(0) < s.metadata.generation.unwrap_or(0) {
                    return false;
                }
                let desired = s.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(1);
                status.updated_replicas.unwrap_or(0) >= desired
                    && status.ready_replicas.unwrap_or(0) >= desired
            }
        }
    }

    /// Clear server-assigned metadata so two objects can be compared
    /// structurally.
    pub fn sanitize(&mut self) {
        sanitize_object_meta(self.metadata_mut());
    }
}

/// Strip the server-assigned fields that change on every write.
pub fn sanitize_object_meta(meta: &mut ObjectMeta) {
    meta.resource_version = None;
    meta.generation = None;
    meta.creation_timestamp = None;
}

/// Service counterpart of [`Workload::sanitize`].
pub fn sanitize_service(svc: &mut Service) {
    sanitize_object_meta(&mut svc.metadata);
}
