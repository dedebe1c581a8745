//! Decides which edits constitute a correct install
//!
//! The planner is a pure function from a `(workload, service, port)`
//! selection to the pair of plans the driver will apply. It resolves the
//! service port, finds the container port behind it, chooses the symbolic
//! name the agent will own, and decides which of the mutually exclusive
//! service edits applies. Everything irreversible happens later; planning
//! performs no mutation and can fail without consequence.

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use crate::actions::service::{AddSymbolicPort, MakePortSymbolic, ServiceActions};
use crate::actions::workload::{AddTrafficAgent, HideContainerPort, WorkloadActions};
use crate::workload::Workload;
use crate::{Error, Result, AGENT_CONTAINER_NAME, HIDDEN_PORT_PREFIX, MAX_PORT_NAME_LEN,
    SYMBOLIC_PORT_PREFIX};

/// The pair of plans produced for one install.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentPlan {
    /// Edits to the service; may be empty when the service already
    /// references the chosen symbolic name.
    pub service: ServiceActions,
    /// Edits to the workload; always contains the agent injection.
    pub workload: WorkloadActions,
}

/// How the selected service port referenced its target before the install.
#[derive(Clone, Debug, PartialEq, Eq)]
enum TargetRef {
    /// Explicit numeric targetPort.
    Numeric(u16),
    /// No targetPort; Kubernetes defaults it to the port value.
    Unset,
    /// Symbolic targetPort naming a container port.
    Symbolic(String),
}

/// The container port the service selection resolved to.
#[derive(Clone, Debug)]
struct ResolvedPort {
    container_name: String,
    port_number: u16,
    protocol: Option<String>,
}

/// Compute the plans for injecting a traffic-agent into `workload` behind
/// `service`.
///
/// `port_identifier` picks a service port by name or number and may be
/// omitted when the service has exactly one. The returned plans are tagged
/// with this engine's version and are what gets persisted for the eventual
/// undo.
pub fn plan_agent_injection(
    workload: &Workload,
    service: &Service,
    port_identifier: Option<&str>,
    agent_image: &str,
    manager_namespace: &str,
) -> Result<AgentPlan> {
    if workload
        .containers()
        .iter()
        .any(|c| c.name == AGENT_CONTAINER_NAME)
    {
        return Err(Error::already_exists(format!(
            "{} {} already has a container {AGENT_CONTAINER_NAME}",
            workload.kind(),
            workload.name(),
        )));
    }

    let svc_port = resolve_service_port(service, port_identifier)?;
    let target = target_ref(service, svc_port)?;
    let resolved = resolve_container_port(workload, svc_port, &target)?;

    // The name the agent's container port will carry. A pre-install
    // symbolic targetPort is adopted as-is; anything else gets a
    // deterministic invented name that undo never has to reconstruct.
    let symbolic_name = match &target {
        TargetRef::Symbolic(name) => name.clone(),
        _ => {
            let base = svc_port
                .name
                .clone()
                .unwrap_or_else(|| resolved.port_number.to_string());
            clip_port_name(&format!("{SYMBOLIC_PORT_PREFIX}{base}"))
        }
    };
    debug!(
        symbolic = %symbolic_name,
        container = %resolved.container_name,
        port = resolved.port_number,
        "resolved intercept selection"
    );

    let mut service_plan = ServiceActions::new(crate::VERSION);
    let symbolic = MakePortSymbolic {
        port_name: svc_port.name.clone().unwrap_or_default(),
        target_port: resolved.port_number,
        symbolic_name: symbolic_name.clone(),
    };
    match &target {
        TargetRef::Numeric(_) => service_plan.make_port_symbolic = Some(symbolic),
        TargetRef::Unset => service_plan.add_symbolic_port = Some(AddSymbolicPort(symbolic)),
        TargetRef::Symbolic(_) => {}
    }

    // When the application container already owns a port by the chosen
    // name, it must step aside so the name resolves to the agent.
    let hide = workload
        .containers()
        .iter()
        .find(|c| c.name == resolved.container_name)
        .filter(|c| {
            c.ports
                .as_deref()
                .unwrap_or(&[])
                .iter()
                .any(|p| p.name.as_deref() == Some(symbolic_name.as_str()))
        })
        .map(|c| HideContainerPort {
            container_name: c.name.clone(),
            port_name: symbolic_name.clone(),
            hidden_name: clip_port_name(&format!("{HIDDEN_PORT_PREFIX}{symbolic_name}")),
        });

    let workload_plan = WorkloadActions {
        version: crate::VERSION.to_string(),
        referenced_service: service.metadata.name.clone().unwrap_or_default(),
        referenced_service_port_name: svc_port.name.clone(),
        hide_container_port: hide,
        add_traffic_agent: Some(AddTrafficAgent {
            container_port_name: symbolic_name,
            // Persisted unconditionally; Kubernetes defaults an absent
            // container-port protocol to TCP and so does the plan.
            container_port_proto: resolved.protocol.unwrap_or_else(|| "TCP".to_string()),
            container_port_number: resolved.port_number,
            image_name: agent_image.to_string(),
            container_name: resolved.container_name,
            manager_namespace: manager_namespace.to_string(),
        }),
        ..Default::default()
    };

    Ok(AgentPlan {
        service: service_plan,
        workload: workload_plan,
    })
}

/// Pick the service port the identifier refers to.
fn resolve_service_port<'a>(
    service: &'a Service,
    identifier: Option<&str>,
) -> Result<&'a ServicePort> {
    let svc_name = service.metadata.name.as_deref().unwrap_or_default();
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or(&[]);

    match identifier.filter(|id| !id.is_empty()) {
        None => match ports {
            [] => Err(Error::not_found(format!(
                "service {svc_name} has no ports"
            ))),
            [only] => Ok(only),
            _ => Err(Error::ambiguous(format!(
                "service {svc_name} has {} ports; a port identifier is required",
                ports.len(),
            ))),
        },
        Some(id) => {
            if let Some(p) = ports.iter().find(|p| p.name.as_deref() == Some(id)) {
                return Ok(p);
            }
            if let Ok(number) = id.parse::<i32>() {
                if let Some(p) = ports.iter().find(|p| p.port == number) {
                    return Ok(p);
                }
            }
            Err(Error::not_found(format!(
                "service {svc_name} has no port {id}"
            )))
        }
    }
}

/// Classify the selected port's targetPort, validating number ranges.
fn target_ref(service: &Service, port: &ServicePort) -> Result<TargetRef> {
    let svc_name = service.metadata.name.as_deref().unwrap_or_default();
    match &port.target_port {
        None | Some(IntOrString::Int(0)) => {
            // Defaults to the port value; that value must itself be a
            // usable port number.
            checked_port(port.port, svc_name)?;
            Ok(TargetRef::Unset)
        }
        Some(IntOrString::Int(n)) => Ok(TargetRef::Numeric(checked_port(*n, svc_name)?)),
        Some(IntOrString::String(s)) => Ok(TargetRef::Symbolic(s.clone())),
    }
}

fn checked_port(n: i32, svc_name: &str) -> Result<u16> {
    u16::try_from(n)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            Error::no_acceptable(format!(
                "port {n} in service {svc_name} is outside 1-65535"
            ))
        })
}

/// Find the container port the service's targetPort resolves to.
///
/// A symbolic targetPort matches by name, a numeric one by number, an
/// unset one by the service port's own number. Exactly one container may
/// match; the agent cannot take over a port served by several.
fn resolve_container_port(
    workload: &Workload,
    svc_port: &ServicePort,
    target: &TargetRef,
) -> Result<ResolvedPort> {
    let mut matches: Vec<ResolvedPort> = Vec::new();
    for container in workload.containers() {
        for port in container.ports.as_deref().unwrap_or(&[]) {
            let hit = match target {
                TargetRef::Symbolic(name) => port.name.as_deref() == Some(name.as_str()),
                TargetRef::Numeric(n) => port.container_port == i32::from(*n),
                TargetRef::Unset => port.container_port == svc_port.port,
            };
            if hit {
                matches.push(ResolvedPort {
                    container_name: container.name.clone(),
                    port_number: checked_port(port.container_port, "")
                        .map_err(|_| {
                            Error::no_acceptable(format!(
                                "container port {} in {} {} is outside 1-65535",
                                port.container_port,
                                workload.kind(),
                                workload.name(),
                            ))
                        })?,
                    protocol: port.protocol.clone(),
                });
            }
        }
    }
    let describe = || match target {
        TargetRef::Symbolic(name) => format!("port name {name}"),
        TargetRef::Numeric(n) => format!("port number {n}"),
        TargetRef::Unset => format!("port number {}", svc_port.port),
    };
    match matches.len() {
        0 => Err(Error::no_acceptable(format!(
            "found no container in {} {} with a port matching {} of service {}",
            workload.kind(),
            workload.name(),
            describe(),
            svc_port.name.as_deref().unwrap_or("<unnamed>"),
        ))),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::ambiguous(format!(
            "{} of service port {} matches containers {} in {} {}",
            describe(),
            svc_port.name.as_deref().unwrap_or("<unnamed>"),
            matches
                .iter()
                .map(|m| m.container_name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            workload.kind(),
            workload.name(),
        ))),
    }
}

/// Clip a generated name to the Kubernetes port-name limit.
fn clip_port_name(name: &str) -> String {
    name.chars().take(MAX_PORT_NAME_LEN).collect()
}
