//! Tether - reversible traffic-agent injection for Kubernetes workloads
//!
//! Tether lets a developer redirect traffic destined for a workload running in
//! a remote Kubernetes cluster to a process on their local workstation. This
//! crate is the workload-mutation engine behind that: a reversible, idempotent
//! set of edits applied to a Deployment/ReplicaSet/StatefulSet and its
//! fronting Service that injects the traffic-agent sidecar, rewires the
//! service port through a symbolic name the sidecar owns, and can exactly undo
//! those edits later from nothing but an annotation left on the mutated
//! objects.
//!
//! # Architecture
//!
//! Installation is a pipeline: a selection `(workload, service, port)` goes
//! through the planner, which emits a pair of plans (service edits, workload
//! edits); the plans are applied in memory, serialized into an annotation on
//! each mutated object, and written back through the Kubernetes API. Removal
//! reads the annotation back, undoes the recorded edits in reverse order, and
//! strips the annotation. The annotation is the sole authoritative signal
//! that an object is in the installed state.
//!
//! # Modules
//!
//! - [`actions`] - the vocabulary of reversible edits and their composition
//! - [`planner`] - decides which edits constitute a correct install
//! - [`annotation`] - plan persistence as a JSON annotation, version gating
//! - [`workload`] - polymorphic handling of the three workload kinds
//! - [`installer`] - the driver: fetch, plan, apply, write, wait, undo
//! - [`retry`] - bounded retry for resource-version conflicts
//! - [`error`] - error types and wire codes

#![deny(missing_docs)]

pub mod actions;
pub mod annotation;
pub mod error;
pub mod installer;
pub mod planner;
pub mod retry;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Engine Constants
// =============================================================================
// The values below are contractual: they are persisted in cluster annotations
// or observed by the traffic-agent and traffic-manager at runtime. Changing
// any of them breaks undo of plans written by earlier releases.

/// Engine version stamped into every plan this build produces.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the injected sidecar container.
pub const AGENT_CONTAINER_NAME: &str = "traffic-agent";

/// Port the traffic-agent listens on, regardless of the application port.
///
/// The service's symbolic targetPort resolves to this number through the
/// agent's named container port.
pub const AGENT_PORT: i32 = 9900;

/// Prefix under which the agent mirrors the application container's
/// environment variables.
pub const ENV_PREFIX: &str = "TEL_APP_";

/// Root under which the agent re-mounts the application container's volumes.
pub const AGENT_MOUNT_POINT: &str = "/tel_app_mounts";

/// Name of the traffic-manager workload and service.
pub const MANAGER_APP_NAME: &str = "traffic-manager";

/// Annotation key under which a serialized plan is stored on mutated objects.
pub const ACTIONS_ANNOTATION: &str = "tether.io/actions";

/// Prefix for container-port names hidden from the service by a rename.
pub const HIDDEN_PORT_PREFIX: &str = "tel2mv-";

/// Prefix for symbolic service-port names invented by the planner.
pub const SYMBOLIC_PORT_PREFIX: &str = "tel2px-";

/// Kubernetes limit on port-name length; every generated name is clipped
/// to this.
pub const MAX_PORT_NAME_LEN: usize = 15;
