//! Reversible edits over a workload's pod template
//!
//! [`HideContainerPort`] renames a container port out of the service's
//! sight, and [`AddTrafficAgent`] appends the sidecar. Both operate on the
//! pod template through the [`Workload`] accessors only, so Deployments,
//! ReplicaSets and StatefulSets are all handled by the same code.

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvFromSource, EnvVar, EnvVarSource, ExecAction,
    ObjectFieldSelector, Probe,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

use crate::actions::{
    actions_done, apply_actions, explain_actions, undo_actions, Action, Explain, MultiAction,
};
use crate::workload::Workload;
use crate::{Error, Result, AGENT_CONTAINER_NAME, AGENT_MOUNT_POINT, AGENT_PORT, ENV_PREFIX,
    MANAGER_APP_NAME};

// =============================================================================
// HideContainerPort
// =============================================================================

/// Rename a container port so the service can no longer reach it by name.
///
/// Once the agent owns the service's symbolic port, the application's port
/// of the same name must get out of the way, yet the container must keep
/// listening so the agent can forward to it. Renaming rather than deleting
/// preserves every other property. Probes that reference the port by its
/// string name are rewritten along with it; numeric probe references are
/// left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HideContainerPort {
    /// The container whose port is being renamed.
    pub container_name: String,
    /// The original port name.
    pub port_name: String,
    /// The replacement name, derived from the original by the planner.
    pub hidden_name: String,
}

impl HideContainerPort {
    /// Locate `(container index, port index)` of the named port within the
    /// action's container.
    fn find_port(&self, workload: &Workload, name: &str) -> Option<(usize, usize)> {
        workload
            .containers()
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == self.container_name)
            .and_then(|(ci, c)| {
                c.ports
                    .as_ref()?
                    .iter()
                    .position(|p| p.name.as_deref() == Some(name))
                    .map(|pi| (ci, pi))
            })
    }

    fn swap_port_name(&self, workload: &mut Workload, from: &str, to: &str) -> Result<()> {
        let Some((ci, pi)) = self.find_port(workload, from) else {
            return Err(Error::not_found(format!(
                "unable to locate port {} in container {} of {} {}",
                from,
                self.container_name,
                workload.kind(),
                workload.name(),
            )));
        };
        let container = &mut workload.containers_mut()?[ci];
        for probe in [
            container.liveness_probe.as_mut(),
            container.readiness_probe.as_mut(),
            container.startup_probe.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(http) = probe.http_get.as_mut() {
                if http.port == IntOrString::String(from.to_string()) {
                    http.port = IntOrString::String(to.to_string());
                }
            }
            if let Some(tcp) = probe.tcp_socket.as_mut() {
                if tcp.port == IntOrString::String(from.to_string()) {
                    tcp.port = IntOrString::String(to.to_string());
                }
            }
        }
        if let Some(ports) = container.ports.as_mut() {
            ports[pi].name = Some(to.to_string());
        }
        Ok(())
    }
}

impl Action for HideContainerPort {
    type Target = Workload;

    fn apply(&self, workload: &mut Workload) -> Result<()> {
        self.swap_port_name(workload, &self.port_name, &self.hidden_name)
    }

    fn undo(&self, workload: &mut Workload) -> Result<()> {
        self.swap_port_name(workload, &self.hidden_name, &self.port_name)
    }

    fn is_done(&self, workload: &Workload) -> bool {
        self.find_port(workload, &self.hidden_name).is_some()
    }

    fn explain_apply(&self, _: &Workload) -> String {
        format!(
            "hide port {:?} in container {} from the service by renaming it to {:?}",
            self.port_name, self.container_name, self.hidden_name,
        )
    }

    fn explain_undo(&self, _: &Workload) -> String {
        format!(
            "reveal hidden port {:?} in container {} by restoring its original name {:?}",
            self.hidden_name, self.container_name, self.port_name,
        )
    }
}

// =============================================================================
// AddTrafficAgent
// =============================================================================

/// Append the traffic-agent sidecar to the pod template.
///
/// The agent mirrors the application container's environment (under the
/// `TEL_APP_` prefix) and volume mounts (under `/tel_app_mounts`) so a
/// local process can reconstruct the application's view of the world, and
/// listens on the fixed agent port behind the symbolic port name the
/// service now targets.
///
/// The action reads the application container once during apply and never
/// mutates it. Undo only needs the fixed agent container name, which is why
/// neither `container_name` nor `manager_namespace` is persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTrafficAgent {
    /// Name of the agent's container port; the service's symbolic
    /// targetPort resolves through it.
    pub container_port_name: String,
    /// Protocol of the port being taken over; always persisted, `TCP` when
    /// the source port did not set one.
    #[serde(default)]
    pub container_port_proto: String,
    /// The application's original port number; the agent forwards here when
    /// no intercept is active.
    #[serde(rename = "app_port")]
    pub container_port_number: u16,
    /// Agent image reference.
    pub image_name: String,
    /// Name of the application container to mirror. Not persisted: undo
    /// never needs it.
    #[serde(skip)]
    pub container_name: String,
    /// Namespace the traffic-manager runs in. Not persisted either.
    #[serde(skip)]
    pub manager_namespace: String,
}

impl AddTrafficAgent {
    fn agent_environment(&self, workload_name: &str, app: &Container) -> Vec<EnvVar> {
        let app_env = app.env.as_deref().unwrap_or(&[]);
        let mut env = Vec::with_capacity(app_env.len() + 8);
        for var in app_env {
            env.push(EnvVar {
                name: format!("{ENV_PREFIX}{}", var.name),
                ..var.clone()
            });
        }
        env.push(EnvVar {
            name: "TELEPRESENCE_CONTAINER".to_string(),
            value: Some(app.name.clone()),
            value_from: None,
        });
        env.push(plain("LOG_LEVEL", "debug"));
        env.push(plain("AGENT_NAME", workload_name));
        env.push(downward("AGENT_POD_NAME", "metadata.name"));
        env.push(downward("AGENT_NAMESPACE", "metadata.namespace"));
        env.push(plain("APP_PORT", &self.container_port_number.to_string()));
        if let Some(mounts) = app.volume_mounts.as_deref().filter(|m| !m.is_empty()) {
            env.push(plain("APP_MOUNTS", AGENT_MOUNT_POINT));
            // The original mount points travel along so the local client can
            // recreate them as symlinks.
            let paths: Vec<&str> = mounts.iter().map(|m| m.mount_path.as_str()).collect();
            env.push(plain(
                &format!("{ENV_PREFIX}TELEPRESENCE_MOUNTS"),
                &paths.join(":"),
            ));
        }
        env.push(plain(
            "MANAGER_HOST",
            &format!("{MANAGER_APP_NAME}.{}", self.manager_namespace),
        ));
        env
    }

    fn agent_env_from(&self, app: &Container) -> Option<Vec<EnvFromSource>> {
        let app_ef = app.env_from.as_deref().filter(|ef| !ef.is_empty())?;
        Some(
            app_ef
                .iter()
                .map(|ef| EnvFromSource {
                    prefix: Some(format!(
                        "{ENV_PREFIX}{}",
                        ef.prefix.as_deref().unwrap_or_default()
                    )),
                    ..ef.clone()
                })
                .collect(),
        )
    }

    fn agent_volume_mounts(
        &self,
        app: &Container,
    ) -> Option<Vec<k8s_openapi::api::core::v1::VolumeMount>> {
        let mounts = app.volume_mounts.as_deref().filter(|m| !m.is_empty())?;
        Some(
            mounts
                .iter()
                .map(|m| {
                    let mut remapped = m.clone();
                    remapped.mount_path = if m.mount_path.starts_with('/') {
                        format!("{AGENT_MOUNT_POINT}{}", m.mount_path)
                    } else {
                        format!("{AGENT_MOUNT_POINT}/{}", m.mount_path)
                    };
                    remapped
                })
                .collect(),
        )
    }
}

fn plain(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn downward(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

impl Action for AddTrafficAgent {
    type Target = Workload;

    fn apply(&self, workload: &mut Workload) -> Result<()> {
        let workload_name = workload.name();
        let kind = workload.kind();
        let app = workload
            .containers()
            .iter()
            .find(|c| c.name == self.container_name)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!(
                    "unable to find app container {} in {kind} {workload_name}",
                    self.container_name,
                ))
            })?;

        let agent = Container {
            name: AGENT_CONTAINER_NAME.to_string(),
            image: Some(self.image_name.clone()),
            args: Some(vec!["agent".to_string()]),
            ports: Some(vec![ContainerPort {
                name: Some(self.container_port_name.clone()),
                protocol: (!self.container_port_proto.is_empty())
                    .then(|| self.container_port_proto.clone()),
                container_port: AGENT_PORT,
                ..Default::default()
            }]),
            env: Some(self.agent_environment(&workload_name, &app)),
            env_from: self.agent_env_from(&app),
            volume_mounts: self.agent_volume_mounts(&app),
            readiness_probe: Some(Probe {
                exec: Some(ExecAction {
                    command: Some(vec!["/bin/stat".to_string(), "/tmp/agent/ready".to_string()]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        workload.containers_mut()?.push(agent);
        Ok(())
    }

    fn undo(&self, workload: &mut Workload) -> Result<()> {
        let kind = workload.kind();
        let name = workload.name();
        let containers = workload.containers_mut()?;
        let Some(idx) = containers.iter().position(|c| c.name == AGENT_CONTAINER_NAME) else {
            return Err(Error::not_found(format!(
                "no {AGENT_CONTAINER_NAME} container found in {kind} {name}",
            )));
        };
        // Vec::remove keeps the order of the remaining containers.
        containers.remove(idx);
        Ok(())
    }

    fn is_done(&self, workload: &Workload) -> bool {
        workload
            .containers()
            .iter()
            .any(|c| c.name == AGENT_CONTAINER_NAME)
    }

    fn explain_apply(&self, _: &Workload) -> String {
        format!("add traffic-agent container with image {}", self.image_name)
    }

    fn explain_undo(&self, _: &Workload) -> String {
        format!(
            "remove traffic-agent container with image {}",
            self.image_name
        )
    }
}

// =============================================================================
// WorkloadActions
// =============================================================================

/// The persisted plan of edits applied to a workload.
///
/// `hide_container_port` is absent when the chosen symbolic name collided
/// with nothing. Field names are contractual, like [`super::service::ServiceActions`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadActions {
    /// Engine version that produced the plan.
    pub version: String,
    /// Name of the service whose port the agent took over; undo uses it to
    /// find the service plan without consulting anything else.
    pub referenced_service: String,
    /// Name of the service port, when it had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_service_port_name: Option<String>,
    /// Rename of a colliding container port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_container_port: Option<HideContainerPort>,
    /// The sidecar injection itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_traffic_agent: Option<AddTrafficAgent>,
    /// Stanzas written by a newer engine that this build does not know.
    #[serde(flatten)]
    pub unknown_fields: serde_json::Map<String, serde_json::Value>,
}

impl WorkloadActions {
    /// A plan with no edits, tagged with the given engine version.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Default::default()
        }
    }
}

impl Action for WorkloadActions {
    type Target = Workload;

    fn apply(&self, workload: &mut Workload) -> Result<()> {
        apply_actions(self, workload)
    }

    fn undo(&self, workload: &mut Workload) -> Result<()> {
        undo_actions(self, workload)
    }

    fn is_done(&self, workload: &Workload) -> bool {
        actions_done(self, workload)
    }

    fn explain_apply(&self, workload: &Workload) -> String {
        let object = format!("{} {}", workload.kind(), workload.name());
        explain_actions(self, workload, &object, Explain::Apply)
    }

    fn explain_undo(&self, workload: &Workload) -> String {
        let object = format!("{} {}", workload.kind(), workload.name());
        explain_actions(self, workload, &object, Explain::Undo)
    }
}

impl MultiAction for WorkloadActions {
    fn actions(&self) -> Vec<&dyn Action<Target = Workload>> {
        let mut actions: Vec<&dyn Action<Target = Workload>> = Vec::new();
        if let Some(a) = &self.hide_container_port {
            actions.push(a);
        }
        if let Some(a) = &self.add_traffic_agent {
            actions.push(a);
        }
        actions
    }

    fn object_type(&self) -> &'static str {
        "workload"
    }

    fn plan_version(&self) -> &str {
        &self.version
    }
}
