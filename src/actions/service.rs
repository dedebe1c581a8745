//! Reversible edits over a Service's ports
//!
//! Two edits exist because Kubernetes treats a missing `targetPort`
//! differently from an explicit one: [`MakePortSymbolic`] rewrites an
//! explicit numeric `targetPort` to a symbolic name and restores the exact
//! number on undo, while [`AddSymbolicPort`] fills in a `targetPort` that
//! was absent and clears it again on undo. Picking the wrong one would
//! produce a change undo cannot invert, which is why the planner records
//! the distinction instead of guessing later.

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

use crate::actions::{
    actions_done, apply_actions, explain_actions, undo_actions, Action, Explain, MultiAction,
};
use crate::{Error, Result};

fn service_name(svc: &Service) -> String {
    svc.metadata.name.clone().unwrap_or_default()
}

fn ports_mut(svc: &mut Service) -> Option<&mut Vec<ServicePort>> {
    svc.spec.as_mut().and_then(|s| s.ports.as_mut())
}

fn ports(svc: &Service) -> &[ServicePort] {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or(&[])
}

// =============================================================================
// MakePortSymbolic
// =============================================================================

/// Replace a numeric `targetPort` with a symbolic name owned by the agent.
///
/// The traffic-agent advertises itself on a named container port; pointing
/// the service's `targetPort` at that name redirects incoming traffic
/// through the agent without changing the service's identity or UID. The
/// original number survives in the payload so undo is exact.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakePortSymbolic {
    /// Name of the service port to rewrite; empty for an unnamed port.
    #[serde(rename = "PortName")]
    pub port_name: String,
    /// The numeric targetPort being replaced, and restored on undo.
    #[serde(rename = "TargetPort")]
    pub target_port: u16,
    /// The symbolic name the targetPort is rewritten to.
    #[serde(rename = "SymbolicName")]
    pub symbolic_name: String,
}

impl MakePortSymbolic {
    /// Port identifier for messages: `name.port` when the port is named.
    fn display_port(&self, port: &str) -> String {
        if self.port_name.is_empty() {
            port.to_string()
        } else {
            format!("{}.{}", self.port_name, port)
        }
    }

    fn matches(&self, p: &ServicePort, target: &IntOrString) -> bool {
        p.name.as_deref().unwrap_or("") == self.port_name
            && p.target_port.as_ref() == Some(target)
    }

    fn get_port_mut<'a>(
        &self,
        svc: &'a mut Service,
        target: &IntOrString,
    ) -> Result<&'a mut ServicePort> {
        let name = service_name(svc);
        ports_mut(svc)
            .and_then(|ports| ports.iter_mut().find(|p| self.matches(p, target)))
            .ok_or_else(|| {
                Error::not_found(format!(
                    "unable to find target port {} in service {}",
                    self.display_port(&target_string(target)),
                    name,
                ))
            })
    }
}

fn target_string(target: &IntOrString) -> String {
    match target {
        IntOrString::Int(n) => n.to_string(),
        IntOrString::String(s) => s.clone(),
    }
}

impl Action for MakePortSymbolic {
    type Target = Service;

    fn apply(&self, svc: &mut Service) -> Result<()> {
        let port = self.get_port_mut(svc, &IntOrString::Int(i32::from(self.target_port)))?;
        port.target_port = Some(IntOrString::String(self.symbolic_name.clone()));
        Ok(())
    }

    fn undo(&self, svc: &mut Service) -> Result<()> {
        let port = self.get_port_mut(svc, &IntOrString::String(self.symbolic_name.clone()))?;
        port.target_port = Some(IntOrString::Int(i32::from(self.target_port)));
        Ok(())
    }

    fn is_done(&self, svc: &Service) -> bool {
        let symbolic = IntOrString::String(self.symbolic_name.clone());
        ports(svc).iter().any(|p| self.matches(p, &symbolic))
    }

    fn explain_apply(&self, _: &Service) -> String {
        format!(
            "make service port {} symbolic with name {:?}",
            self.display_port(&self.target_port.to_string()),
            self.symbolic_name,
        )
    }

    fn explain_undo(&self, _: &Service) -> String {
        format!(
            "restore symbolic service port {} to numeric {}",
            self.display_port(&self.symbolic_name),
            self.target_port,
        )
    }
}

// =============================================================================
// AddSymbolicPort
// =============================================================================

/// Set a symbolic `targetPort` on a service port that had none.
///
/// Kubernetes defaults an absent `targetPort` to the port value, so this is
/// the counterpart of [`MakePortSymbolic`] for services that relied on the
/// default. Undo clears the field again rather than writing the number
/// back; the original never had one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddSymbolicPort(
    /// Shares the payload and persisted shape of [`MakePortSymbolic`].
    pub MakePortSymbolic,
);

impl Action for AddSymbolicPort {
    type Target = Service;

    fn apply(&self, svc: &mut Service) -> Result<()> {
        let name = service_name(svc);
        let want = i32::from(self.0.target_port);
        let port = ports_mut(svc)
            .and_then(|ports| {
                ports.iter_mut().find(|p| {
                    // An explicit Int(0) is the same "defaulted" state as an
                    // absent field.
                    matches!(p.target_port, None | Some(IntOrString::Int(0))) && p.port == want
                })
            })
            .ok_or_else(|| {
                Error::not_found(format!("unable to find port {want} in service {name}"))
            })?;
        port.target_port = Some(IntOrString::String(self.0.symbolic_name.clone()));
        Ok(())
    }

    fn undo(&self, svc: &mut Service) -> Result<()> {
        let port = self
            .0
            .get_port_mut(svc, &IntOrString::String(self.0.symbolic_name.clone()))?;
        port.target_port = None;
        Ok(())
    }

    fn is_done(&self, svc: &Service) -> bool {
        self.0.is_done(svc)
    }

    fn explain_apply(&self, _: &Service) -> String {
        format!(
            "add targetPort to service port {} symbolic with name {:?}",
            self.0.display_port(&self.0.target_port.to_string()),
            self.0.symbolic_name,
        )
    }

    fn explain_undo(&self, _: &Service) -> String {
        format!(
            "remove symbolic service port {}",
            self.0.display_port(&self.0.symbolic_name),
        )
    }
}

// =============================================================================
// ServiceActions
// =============================================================================

/// The persisted plan of edits applied to a Service.
///
/// At most one of the two port edits is set; they are mutually exclusive by
/// construction in the planner. Field names below are contractual: the JSON
/// is parsed back by whatever engine version performs the undo.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceActions {
    /// Engine version that produced the plan.
    pub version: String,
    /// Rewrite of an explicit numeric targetPort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make_port_symbolic: Option<MakePortSymbolic>,
    /// Fill-in of an absent targetPort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_symbolic_port: Option<AddSymbolicPort>,
    /// Stanzas written by a newer engine that this build does not know.
    /// Their presence blocks undo; see the annotation version gate.
    #[serde(flatten)]
    pub unknown_fields: serde_json::Map<String, serde_json::Value>,
}

impl ServiceActions {
    /// A plan with no edits, tagged with the given engine version.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Default::default()
        }
    }

    /// Whether the plan contains no edits at all.
    pub fn is_empty(&self) -> bool {
        self.make_port_symbolic.is_none() && self.add_symbolic_port.is_none()
    }
}

impl Action for ServiceActions {
    type Target = Service;

    fn apply(&self, svc: &mut Service) -> Result<()> {
        apply_actions(self, svc)
    }

    fn undo(&self, svc: &mut Service) -> Result<()> {
        undo_actions(self, svc)
    }

    fn is_done(&self, svc: &Service) -> bool {
        actions_done(self, svc)
    }

    fn explain_apply(&self, svc: &Service) -> String {
        let object = format!("service {}", service_name(svc));
        explain_actions(self, svc, &object, Explain::Apply)
    }

    fn explain_undo(&self, svc: &Service) -> String {
        let object = format!("service {}", service_name(svc));
        explain_actions(self, svc, &object, Explain::Undo)
    }
}

impl MultiAction for ServiceActions {
    fn actions(&self) -> Vec<&dyn Action<Target = Service>> {
        let mut actions: Vec<&dyn Action<Target = Service>> = Vec::new();
        if let Some(a) = &self.make_port_symbolic {
            actions.push(a);
        }
        if let Some(a) = &self.add_symbolic_port {
            actions.push(a);
        }
        actions
    }

    fn object_type(&self) -> &'static str {
        "service"
    }

    fn plan_version(&self) -> &str {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service(ports_in: Vec<ServicePort>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("hello".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(ports_in),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn port(name: &str, port: i32, target: Option<IntOrString>) -> ServicePort {
        ServicePort {
            name: (!name.is_empty()).then(|| name.to_string()),
            port,
            target_port: target,
            ..Default::default()
        }
    }

    #[test]
    fn make_symbolic_rewrites_and_restores() {
        let action = MakePortSymbolic {
            port_name: "web".to_string(),
            target_port: 8080,
            symbolic_name: "tel2px-web".to_string(),
        };
        let original = service(vec![port("web", 80, Some(IntOrString::Int(8080)))]);
        let mut svc = original.clone();

        assert!(!action.is_done(&svc));
        action.apply(&mut svc).unwrap();
        assert!(action.is_done(&svc));
        assert_eq!(
            ports(&svc)[0].target_port,
            Some(IntOrString::String("tel2px-web".to_string()))
        );

        action.undo(&mut svc).unwrap();
        assert_eq!(svc, original);
    }

    #[test]
    fn make_symbolic_requires_the_exact_numeric_target() {
        let action = MakePortSymbolic {
            port_name: "web".to_string(),
            target_port: 8080,
            symbolic_name: "tel2px-web".to_string(),
        };
        // targetPort differs from the recorded number
        let mut svc = service(vec![port("web", 80, Some(IntOrString::Int(9090)))]);
        let err = action.apply(&mut svc).unwrap_err();
        assert!(err.to_string().contains("web.8080"));

        // port name differs
        let mut svc = service(vec![port("api", 80, Some(IntOrString::Int(8080)))]);
        assert!(action.apply(&mut svc).is_err());
    }

    #[test]
    fn undo_without_marker_fails() {
        let action = MakePortSymbolic {
            port_name: "web".to_string(),
            target_port: 8080,
            symbolic_name: "tel2px-web".to_string(),
        };
        let mut svc = service(vec![port("web", 80, Some(IntOrString::Int(8080)))]);
        let err = action.undo(&mut svc).unwrap_err();
        assert!(err.to_string().contains("tel2px-web"));
    }

    #[test]
    fn add_symbolic_fills_and_clears() {
        let action = AddSymbolicPort(MakePortSymbolic {
            port_name: String::new(),
            target_port: 80,
            symbolic_name: "tel2px-80".to_string(),
        });
        let original = service(vec![port("", 80, None)]);
        let mut svc = original.clone();

        action.apply(&mut svc).unwrap();
        assert_eq!(
            ports(&svc)[0].target_port,
            Some(IntOrString::String("tel2px-80".to_string()))
        );

        // Undo clears the field entirely; the original had none.
        action.undo(&mut svc).unwrap();
        assert_eq!(svc, original);
    }

    #[test]
    fn add_symbolic_treats_int_zero_as_unset() {
        let action = AddSymbolicPort(MakePortSymbolic {
            port_name: String::new(),
            target_port: 80,
            symbolic_name: "tel2px-80".to_string(),
        });
        let mut svc = service(vec![port("", 80, Some(IntOrString::Int(0)))]);
        action.apply(&mut svc).unwrap();
        assert!(action.is_done(&svc));
    }

    #[test]
    fn add_symbolic_refuses_an_explicit_target() {
        let action = AddSymbolicPort(MakePortSymbolic {
            port_name: String::new(),
            target_port: 80,
            symbolic_name: "tel2px-80".to_string(),
        });
        let mut svc = service(vec![port("", 80, Some(IntOrString::Int(8080)))]);
        assert!(action.apply(&mut svc).is_err());
    }

    #[test]
    fn plan_serializes_with_contract_field_names() {
        let plan = ServiceActions {
            version: "2.3.0".to_string(),
            make_port_symbolic: Some(MakePortSymbolic {
                port_name: "web".to_string(),
                target_port: 8080,
                symbolic_name: "tel2px-web".to_string(),
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "version": "2.3.0",
                "make_port_symbolic": {
                    "PortName": "web",
                    "TargetPort": 8080,
                    "SymbolicName": "tel2px-web",
                },
            })
        );
    }

    #[test]
    fn plan_preserves_unknown_stanzas_on_parse() {
        let json = r#"{
            "version": "9.0.0",
            "add_symbolic_port": {"PortName": "", "TargetPort": 80, "SymbolicName": "x"},
            "rewrite_node_port": {"NodePort": 31000}
        }"#;
        let plan: ServiceActions = serde_json::from_str(json).unwrap();
        assert!(plan.add_symbolic_port.is_some());
        assert!(plan.unknown_fields.contains_key("rewrite_node_port"));
    }

    #[test]
    fn empty_plan_is_done_and_explains_nothing() {
        let plan = ServiceActions::new("2.3.0");
        let svc = service(vec![]);
        assert!(plan.is_empty());
        assert!(plan.is_done(&svc));
        assert_eq!(plan.explain_apply(&svc), "");
    }
}
