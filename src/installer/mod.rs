//! The driver: fetch, plan, apply, write, wait, undo
//!
//! One installer call is a single pass of a state machine over a
//! `(workload, service)` pair:
//!
//! ```text
//! Absent ──install──> Planning ──plan ok──> Applying ──write+ready──> Installed
//!                        │                      │
//!                        └── error              └── apply failure: roll back
//!                                                   in memory, nothing written
//! Installed ──uninstall──> Undoing ──write──> Absent
//! Installed ──foreign plan version──> Migrating (refused with VERSION_SKEW)
//! ```
//!
//! Writes use optimistic concurrency: each update carries the last-read
//! resourceVersion and a conflict re-enters the pass from a fresh read, at
//! most three times. The plan annotation travels with the same write that
//! injects the agent, so an interrupted install is recognizable as "agent
//! container present without annotation" and is cleaned up by the next
//! call, install or uninstall alike. The mirror case also happens under
//! conflict: the service write commits and the workload write loses the
//! race, leaving a rewritten service behind an untouched workload. The
//! retry restores such a service from its own plan annotation before
//! planning again.
//!
//! Kubernetes access goes through the [`ObjectStore`] seam and the
//! "manager is installed" check through [`ManagerProbe`]; both have
//! kube-backed implementations here and mock implementations in tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::actions::service::ServiceActions;
use crate::actions::workload::{AddTrafficAgent, WorkloadActions};
use crate::actions::{actions_done, rollback_actions, Action};
use crate::annotation;
use crate::planner::plan_agent_injection;
use crate::retry::{retry_if, RetryConfig};
use crate::workload::Workload;
use crate::{Error, Result, AGENT_CONTAINER_NAME, MANAGER_APP_NAME};

/// How often the rollout wait re-reads the workload status.
const ROLLOUT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default deadline for individual Kubernetes API calls.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for the post-install rollout wait.
pub const DEFAULT_ROLLOUT_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Seams
// =============================================================================

/// Read/write access to the cluster objects the engine mutates.
///
/// Updates must be full replacements carrying the object's last-read
/// resourceVersion; the API server's 409 answer is the concurrency signal
/// the driver retries on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the named workload, whichever of the three kinds it is.
    async fn find_workload(&self, namespace: &str, name: &str) -> Result<Workload>;

    /// Replace a workload, returning the stored object.
    async fn update_workload(&self, workload: &Workload) -> Result<Workload>;

    /// Fetch a service by name.
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    /// Replace a service, returning the stored object.
    async fn update_service(&self, service: &Service) -> Result<Service>;
}

/// The opaque "traffic-manager is installed" check.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagerProbe: Send + Sync {
    /// Succeed when the traffic-manager is present and usable.
    async fn ensure_manager(&self) -> Result<()>;
}

/// [`ObjectStore`] backed by the Kubernetes API.
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Create a store using the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn is_404(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn find_workload(&self, namespace: &str, name: &str) -> Result<Workload> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match deployments.get(name).await {
            Ok(d) => return Ok(Workload::Deployment(d)),
            Err(e) if is_404(&e) => {}
            Err(e) => return Err(e.into()),
        }
        let replica_sets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        match replica_sets.get(name).await {
            Ok(r) => return Ok(Workload::ReplicaSet(r)),
            Err(e) if is_404(&e) => {}
            Err(e) => return Err(e.into()),
        }
        let stateful_sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        match stateful_sets.get(name).await {
            Ok(s) => return Ok(Workload::StatefulSet(s)),
            Err(e) if is_404(&e) => {}
            Err(e) => return Err(e.into()),
        }
        Err(Error::not_found(format!(
            "no deployment, replicaset, or statefulset {namespace}/{name}"
        )))
    }

    async fn update_workload(&self, workload: &Workload) -> Result<Workload> {
        let namespace = workload.namespace();
        let name = workload.name();
        let pp = PostParams::default();
        match workload {
            Workload::Deployment(d) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
                Ok(Workload::Deployment(api.replace(&name, &pp, d).await?))
            }
            Workload::ReplicaSet(r) => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), &namespace);
                Ok(Workload::ReplicaSet(api.replace(&name, &pp, r).await?))
            }
            Workload::StatefulSet(s) => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
                Ok(Workload::StatefulSet(api.replace(&name, &pp, s).await?))
            }
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn update_service(&self, service: &Service) -> Result<Service> {
        let namespace = service.metadata.namespace.clone().unwrap_or_default();
        let name = service.metadata.name.clone().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.replace(&name, &PostParams::default(), service).await?)
    }
}

/// [`ManagerProbe`] that verifies the traffic-manager Deployment exists.
///
/// Installing the manager itself is the caller's concern (it ships as a
/// Helm chart); the engine only refuses to inject agents that would have
/// nothing to talk to.
pub struct KubeManagerProbe {
    client: Client,
    manager_namespace: String,
}

impl KubeManagerProbe {
    /// Create a probe looking in the given namespace.
    pub fn new(client: Client, manager_namespace: impl Into<String>) -> Self {
        Self {
            client,
            manager_namespace: manager_namespace.into(),
        }
    }
}

#[async_trait]
impl ManagerProbe for KubeManagerProbe {
    async fn ensure_manager(&self) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.manager_namespace);
        match api.get(MANAGER_APP_NAME).await {
            Ok(_) => Ok(()),
            Err(e) if is_404(&e) => Err(Error::not_found(format!(
                "{MANAGER_APP_NAME} not found in namespace {}; install the traffic manager \
                 before adding agents",
                self.manager_namespace,
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Installer
// =============================================================================

/// The user-facing entry point of one intercept: which workload, behind
/// which service, on which port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    /// Namespace of both objects.
    pub namespace: String,
    /// Workload name; the kind is discovered.
    pub workload: String,
    /// Name of the service fronting the workload.
    pub service: String,
    /// Service port name or number; may be omitted when the service has
    /// exactly one port.
    pub port_identifier: Option<String>,
}

/// Tunables for the driver.
#[derive(Clone, Debug)]
pub struct InstallerConfig {
    /// Namespace the traffic-manager runs in; also the tail of the agent's
    /// `MANAGER_HOST`.
    pub manager_namespace: String,
    /// Agent image reference injected into workloads.
    pub agent_image: String,
    /// Deadline for individual API calls.
    pub api_timeout: Duration,
    /// Deadline for the post-install rollout wait.
    pub rollout_timeout: Duration,
}

impl InstallerConfig {
    /// Config with default deadlines.
    pub fn new(manager_namespace: impl Into<String>, agent_image: impl Into<String>) -> Self {
        Self {
            manager_namespace: manager_namespace.into(),
            agent_image: agent_image.into(),
            api_timeout: DEFAULT_API_TIMEOUT,
            rollout_timeout: DEFAULT_ROLLOUT_TIMEOUT,
        }
    }

    /// Override the rollout deadline.
    pub fn with_rollout_timeout(mut self, timeout: Duration) -> Self {
        self.rollout_timeout = timeout;
        self
    }
}

/// Drives agent installation and removal for one cluster.
///
/// The installer is one logical actor per `(workload, service)` pair; any
/// number of pairs may be driven in parallel, synchronized only through the
/// API server's resourceVersion compare-and-swap.
pub struct AgentInstaller {
    store: Arc<dyn ObjectStore>,
    manager: Arc<dyn ManagerProbe>,
    config: InstallerConfig,
}

impl AgentInstaller {
    /// Create an installer over explicit seams; tests pass mocks here.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        manager: Arc<dyn ManagerProbe>,
        config: InstallerConfig,
    ) -> Self {
        Self {
            store,
            manager,
            config,
        }
    }

    /// Create an installer wired to the Kubernetes API.
    pub fn from_client(client: Client, config: InstallerConfig) -> Self {
        let manager = KubeManagerProbe::new(client.clone(), config.manager_namespace.clone());
        Self::new(
            Arc::new(KubeObjectStore::new(client)),
            Arc::new(manager),
            config,
        )
    }

    /// Install the traffic-agent for `selection` and wait for the rollout.
    ///
    /// Re-running against an already installed pair is a no-op. A rollout
    /// that misses the deadline returns [`Error::RolloutTimeout`] with the
    /// annotated objects left in place; the caller decides whether to wait
    /// longer or uninstall.
    #[instrument(skip(self, selection, token), fields(
        namespace = %selection.namespace,
        workload = %selection.workload,
        service = %selection.service,
    ))]
    pub async fn install(&self, selection: &Selection, token: &CancellationToken) -> Result<()> {
        self.guarded("ensure manager", token, self.manager.ensure_manager())
            .await?;
        retry_if(
            &RetryConfig::default(),
            "install agent",
            Error::is_conflict,
            || self.try_install(selection, token),
        )
        .await
    }

    /// Remove the traffic-agent and restore the pair to its pre-install
    /// state, using nothing but the persisted plan annotations.
    ///
    /// Succeeds as a no-op when nothing is installed.
    #[instrument(skip(self, token), fields(namespace = %namespace, workload = %workload_name))]
    pub async fn uninstall(
        &self,
        namespace: &str,
        workload_name: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        retry_if(
            &RetryConfig::default(),
            "uninstall agent",
            Error::is_conflict,
            || self.try_uninstall(namespace, workload_name, token),
        )
        .await
    }

    async fn try_install(&self, selection: &Selection, token: &CancellationToken) -> Result<()> {
        let mut workload = self
            .guarded(
                "find workload",
                token,
                self.store.find_workload(&selection.namespace, &selection.workload),
            )
            .await?;
        let mut service = self
            .guarded(
                "get service",
                token,
                self.store.get_service(&selection.namespace, &selection.service),
            )
            .await?;

        // Residue of an interrupted install: the agent landed but the
        // annotation (written in the same update) did not, which means the
        // update itself never happened and something else added the agent,
        // or the object was hand-edited. Remove it and start clean.
        if annotation::get(workload.metadata()).is_none() && has_agent(&workload) {
            warn!("agent container present without a plan annotation; removing it first");
            AddTrafficAgent::default().undo(&mut workload)?;
            workload = self
                .guarded("update workload", token, self.store.update_workload(&workload))
                .await?;
        }

        // The service half of an earlier attempt may have committed while
        // the workload write conflicted or was interrupted. Re-planning
        // against the rewritten targetPort would resolve nothing, so restore
        // the service from its own plan annotation and plan from the clean
        // state.
        if annotation::get(workload.metadata()).is_none() {
            if let Some(json) = annotation::get(&service.metadata).map(str::to_string) {
                warn!("service carries a plan annotation but the workload does not; restoring it");
                let persisted: ServiceActions = annotation::parse_plan(&json)?;
                annotation::ensure_compatible(&persisted.version, &persisted.unknown_fields)?;
                persisted.undo(&mut service)?;
                annotation::clear(&mut service.metadata);
                service = self
                    .guarded("update service", token, self.store.update_service(&service))
                    .await?;
            }
        }

        if let Some(json) = annotation::get(workload.metadata()) {
            let persisted: WorkloadActions = annotation::parse_plan(json)?;
            annotation::ensure_compatible(&persisted.version, &persisted.unknown_fields)?;
            if actions_done(&persisted, &workload) {
                info!(version = %persisted.version, "agent already installed");
                return Ok(());
            }
            return Err(Error::establish(format!(
                "{} {} carries a plan annotation but is not in the installed state; \
                 uninstall first",
                workload.kind(),
                workload.name(),
            )));
        }

        let plan = plan_agent_injection(
            &workload,
            &service,
            selection.port_identifier.as_deref(),
            &self.config.agent_image,
            &self.config.manager_namespace,
        )?;

        let explain = plan.service.explain_apply(&service);
        if !explain.is_empty() {
            info!("{explain}");
        }
        info!("{}", plan.workload.explain_apply(&workload));

        let applied = plan
            .service
            .apply(&mut service)
            .and_then(|()| plan.workload.apply(&mut workload));
        if let Err(e) = applied {
            // In-memory rollback of whatever half was edited; the cluster
            // never sees a partially applied plan.
            rollback_actions(&plan.workload, &mut workload);
            rollback_actions(&plan.service, &mut service);
            return Err(Error::establish(format!(
                "unable to apply agent plan to {} {}: {e}",
                workload.kind(),
                workload.name(),
            )));
        }

        if !plan.service.is_empty() {
            annotation::set(&mut service.metadata, annotation::plan_json(&plan.service));
            self.guarded("update service", token, self.store.update_service(&service))
                .await?;
        }
        // The annotation rides the same write that injects the agent; an
        // interrupted install can never leave an annotated object behind.
        annotation::set(
            workload.metadata_mut(),
            annotation::plan_json(&plan.workload),
        );
        self.guarded("update workload", token, self.store.update_workload(&workload))
            .await?;

        self.wait_for_rollout(&selection.namespace, &selection.workload, token)
            .await
    }

    async fn try_uninstall(
        &self,
        namespace: &str,
        workload_name: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut workload = self
            .guarded(
                "find workload",
                token,
                self.store.find_workload(namespace, workload_name),
            )
            .await?;

        let Some(json) = annotation::get(workload.metadata()).map(str::to_string) else {
            if has_agent(&workload) {
                warn!("agent container present without a plan annotation; removing it");
                AddTrafficAgent::default().undo(&mut workload)?;
                self.guarded("update workload", token, self.store.update_workload(&workload))
                    .await?;
            } else {
                debug!("no agent installed; nothing to do");
            }
            return Ok(());
        };

        let plan: WorkloadActions = annotation::parse_plan(&json)?;
        annotation::ensure_compatible(&plan.version, &plan.unknown_fields)?;
        info!("{}", plan.explain_undo(&workload));

        if let Err(e) = plan.undo(&mut workload) {
            // Undo whatever can still be identified, write that back, and
            // only drop the annotation when no marker of the plan remains.
            // The failure is surfaced either way; the object was in a state
            // this engine did not put it in.
            let restored = rollback_actions(&plan, &mut workload);
            if restored {
                annotation::clear(workload.metadata_mut());
            }
            self.guarded("update workload", token, self.store.update_workload(&workload))
                .await?;
            return Err(Error::remove(format!(
                "unable to undo agent modifications of {} {}: {e}",
                workload.kind(),
                workload.name(),
            )));
        }
        annotation::clear(workload.metadata_mut());
        self.guarded("update workload", token, self.store.update_workload(&workload))
            .await?;

        self.undo_service(namespace, &plan.referenced_service, token)
            .await
    }

    async fn undo_service(
        &self,
        namespace: &str,
        service_name: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        if service_name.is_empty() {
            return Ok(());
        }
        let mut service = match self
            .guarded(
                "get service",
                token,
                self.store.get_service(namespace, service_name),
            )
            .await
        {
            Ok(svc) => svc,
            Err(e) if e.is_api_not_found() || matches!(e, Error::NotFound(_)) => {
                warn!(service = %service_name, "referenced service no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(json) = annotation::get(&service.metadata).map(str::to_string) else {
            return Ok(());
        };
        let plan: ServiceActions = annotation::parse_plan(&json)?;
        annotation::ensure_compatible(&plan.version, &plan.unknown_fields)?;
        let explain = plan.explain_undo(&service);
        if !explain.is_empty() {
            info!("{explain}");
        }

        if let Err(e) = plan.undo(&mut service) {
            let restored = rollback_actions(&plan, &mut service);
            if restored {
                annotation::clear(&mut service.metadata);
            }
            self.guarded("update service", token, self.store.update_service(&service))
                .await?;
            return Err(Error::remove(format!(
                "unable to undo service modifications of {service_name}: {e}",
            )));
        }
        annotation::clear(&mut service.metadata);
        self.guarded("update service", token, self.store.update_service(&service))
            .await?;
        Ok(())
    }

    /// Poll the workload until its rollout is ready or the deadline passes.
    ///
    /// A timeout here does not roll anything back: the installed state is
    /// coherent, only slow.
    async fn wait_for_rollout(
        &self,
        namespace: &str,
        name: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        debug!("waiting for rollout");
        let deadline = tokio::time::Instant::now() + self.config.rollout_timeout;
        loop {
            let workload = self
                .guarded("find workload", token, self.store.find_workload(namespace, name))
                .await?;
            if workload.rollout_ready() {
                info!("rollout complete");
                return Ok(());
            }
            if tokio::time::Instant::now() + ROLLOUT_POLL_INTERVAL >= deadline {
                return Err(Error::RolloutTimeout {
                    workload: name.to_string(),
                    timeout: self.config.rollout_timeout,
                });
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Interrupted),
                _ = tokio::time::sleep(ROLLOUT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Run one API call under the configured deadline and the caller's
    /// cancellation token.
    async fn guarded<T>(
        &self,
        operation: &str,
        token: &CancellationToken,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Interrupted),
            res = tokio::time::timeout(self.config.api_timeout, fut) => match res {
                Ok(r) => r,
                Err(_) => Err(Error::ApiTimeout {
                    operation: operation.to_string(),
                    timeout: self.config.api_timeout,
                }),
            },
        }
    }
}

fn has_agent(workload: &Workload) -> bool {
    workload
        .containers()
        .iter()
        .any(|c| c.name == AGENT_CONTAINER_NAME)
}
