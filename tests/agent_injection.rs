//! Round-trip properties of the agent injection engine
//!
//! Every test here follows the same arc as a real install: plan against a
//! YAML fixture, apply the plans, persist them as annotations, then undo
//! from the parsed annotations alone and require the original objects back,
//! byte for byte after stripping server-assigned metadata.

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Deserialize;

use tether::actions::service::ServiceActions;
use tether::actions::workload::WorkloadActions;
use tether::actions::Action;
use tether::planner::plan_agent_injection;
use tether::workload::{sanitize_service, Workload};
use tether::{annotation, AGENT_CONTAINER_NAME, AGENT_PORT};

const AGENT_IMAGE: &str = "registry.local/tether-agent:2.3.0";
const MANAGER_NAMESPACE: &str = "ambassador";

// =============================================================================
// Fixtures
// =============================================================================

/// One test case: exactly one workload kind, its service, and an optional
/// port identifier.
#[derive(Deserialize)]
struct Fixture {
    #[serde(default)]
    deployment: Option<Deployment>,
    #[serde(default)]
    replicaset: Option<ReplicaSet>,
    #[serde(default)]
    statefulset: Option<StatefulSet>,
    service: Service,
    #[serde(rename = "interceptPort", default)]
    intercept_port: Option<String>,
}

fn load(yaml: &str) -> (Workload, Service, Option<String>) {
    let fixture: Fixture = serde_yaml::from_str(yaml).expect("fixture parses");
    let workload = match (fixture.deployment, fixture.replicaset, fixture.statefulset) {
        (Some(d), None, None) => Workload::Deployment(d),
        (None, Some(r), None) => Workload::ReplicaSet(r),
        (None, None, Some(s)) => Workload::StatefulSet(s),
        _ => panic!("fixture must contain exactly one workload"),
    };
    (workload, fixture.service, fixture.intercept_port)
}

const NUMERIC_TARGET_PORT: &str = r#"
deployment:
  metadata:
    name: hello
    namespace: default
    resourceVersion: "4711"
    generation: 3
    creationTimestamp: "2021-03-02T14:26:50Z"
  spec:
    replicas: 1
    selector:
      matchLabels:
        app: hello
    template:
      metadata:
        labels:
          app: hello
      spec:
        containers:
          - name: hello
            image: registry.local/hello:1.0
            ports:
              - name: http
                containerPort: 8080
                protocol: TCP
            env:
              - name: GREETING
                value: moo
service:
  metadata:
    name: hello
    namespace: default
    uid: 2708b88f-f40b-4e27-a97e-c69a6e4b0b75
  spec:
    selector:
      app: hello
    ports:
      - port: 80
        protocol: TCP
        targetPort: 8080
"#;

const DEFAULTED_TARGET_PORT: &str = r#"
deployment:
  metadata:
    name: hello
    namespace: default
  spec:
    selector:
      matchLabels:
        app: hello
    template:
      metadata:
        labels:
          app: hello
      spec:
        containers:
          - name: hello
            image: registry.local/hello:1.0
            ports:
              - name: http
                containerPort: 80
                protocol: TCP
service:
  metadata:
    name: hello
    namespace: default
  spec:
    selector:
      app: hello
    ports:
      - port: 80
        protocol: TCP
"#;

const SYMBOLIC_TARGET_PORT: &str = r#"
deployment:
  metadata:
    name: echo
    namespace: default
  spec:
    selector:
      matchLabels:
        app: echo
    template:
      metadata:
        labels:
          app: echo
      spec:
        containers:
          - name: echo
            image: registry.local/echo:1.4
            ports:
              - name: http
                containerPort: 8080
                protocol: TCP
            livenessProbe:
              httpGet:
                path: /healthz
                port: http
            readinessProbe:
              tcpSocket:
                port: http
            startupProbe:
              httpGet:
                path: /startupz
                port: 8080
service:
  metadata:
    name: echo
    namespace: default
  spec:
    selector:
      app: echo
    ports:
      - port: 80
        protocol: TCP
        targetPort: http
"#;

const REPLICASET_FIXTURE: &str = r#"
replicaset:
  metadata:
    name: hello
    namespace: default
  spec:
    selector:
      matchLabels:
        app: hello
    template:
      metadata:
        labels:
          app: hello
      spec:
        containers:
          - name: hello
            image: registry.local/hello:1.0
            ports:
              - name: http
                containerPort: 8080
service:
  metadata:
    name: hello
    namespace: default
  spec:
    selector:
      app: hello
    ports:
      - port: 80
        targetPort: 8080
"#;

const STATEFULSET_FIXTURE: &str = r#"
statefulset:
  metadata:
    name: hello
    namespace: default
  spec:
    serviceName: hello
    selector:
      matchLabels:
        app: hello
    template:
      metadata:
        labels:
          app: hello
      spec:
        containers:
          - name: hello
            image: registry.local/hello:1.0
            ports:
              - name: http
                containerPort: 8080
service:
  metadata:
    name: hello
    namespace: default
  spec:
    selector:
      app: hello
    ports:
      - port: 80
        targetPort: 8080
"#;

const ENV_FROM_AND_MOUNTS: &str = r#"
deployment:
  metadata:
    name: hello
    namespace: default
  spec:
    selector:
      matchLabels:
        app: hello
    template:
      metadata:
        labels:
          app: hello
      spec:
        containers:
          - name: hello
            image: registry.local/hello:1.0
            ports:
              - name: http
                containerPort: 8080
            envFrom:
              - configMapRef:
                  name: hello-config
              - prefix: EXTRA_
                secretRef:
                  name: hello-secrets
            volumeMounts:
              - name: data
                mountPath: /var/lib/hello
              - name: certs
                mountPath: /etc/certs
                readOnly: true
        volumes:
          - name: data
            emptyDir: {}
          - name: certs
            secret:
              secretName: hello-tls
service:
  metadata:
    name: hello
    namespace: default
  spec:
    selector:
      app: hello
    ports:
      - port: 80
        targetPort: 8080
"#;

const TWO_PORTS: &str = r#"
deployment:
  metadata:
    name: hello
    namespace: default
  spec:
    selector:
      matchLabels:
        app: hello
    template:
      metadata:
        labels:
          app: hello
      spec:
        containers:
          - name: hello
            image: registry.local/hello:1.0
            ports:
              - name: http
                containerPort: 8080
              - name: metrics
                containerPort: 9090
service:
  metadata:
    name: hello
    namespace: default
  spec:
    selector:
      app: hello
    ports:
      - name: web
        port: 80
        targetPort: 8080
      - name: metrics
        port: 9090
        targetPort: 9090
"#;

// =============================================================================
// Helpers
// =============================================================================

/// Apply both plans and persist them as annotations, the way the driver
/// writes objects to the cluster.
fn install(workload: &mut Workload, service: &mut Service, port: Option<&str>) {
    let plan = plan_agent_injection(workload, service, port, AGENT_IMAGE, MANAGER_NAMESPACE)
        .expect("planning succeeds");
    plan.service.apply(service).expect("service plan applies");
    plan.workload.apply(workload).expect("workload plan applies");
    if !plan.service.is_empty() {
        annotation::set(&mut service.metadata, annotation::plan_json(&plan.service));
    }
    annotation::set(
        workload.metadata_mut(),
        annotation::plan_json(&plan.workload),
    );
}

/// Undo from the parsed annotations alone, the way uninstall works.
fn uninstall(workload: &mut Workload, service: &mut Service) {
    let plan: WorkloadActions =
        annotation::parse_plan(annotation::get(workload.metadata()).expect("annotated"))
            .expect("workload plan parses");
    annotation::ensure_compatible(&plan.version, &plan.unknown_fields).expect("compatible");
    plan.undo(workload).expect("workload undo succeeds");
    annotation::clear(workload.metadata_mut());

    if let Some(json) = annotation::get(&service.metadata).map(str::to_string) {
        let plan: ServiceActions = annotation::parse_plan(&json).expect("service plan parses");
        annotation::ensure_compatible(&plan.version, &plan.unknown_fields).expect("compatible");
        plan.undo(service).expect("service undo succeeds");
        annotation::clear(&mut service.metadata);
    }
}

fn sanitized(workload: &Workload) -> Workload {
    let mut w = workload.clone();
    w.sanitize();
    w
}

fn sanitized_svc(service: &Service) -> Service {
    let mut s = service.clone();
    sanitize_service(&mut s);
    s
}

/// Round-trip assertion: install, uninstall, compare against the input.
fn assert_round_trip(yaml: &str) {
    let (pristine_wl, pristine_svc, port) = load(yaml);
    let mut wl = pristine_wl.clone();
    let mut svc = pristine_svc.clone();

    install(&mut wl, &mut svc, port.as_deref());
    assert_ne!(sanitized(&wl), sanitized(&pristine_wl), "install must mutate");

    uninstall(&mut wl, &mut svc);
    assert_eq!(sanitized(&wl), sanitized(&pristine_wl));
    assert_eq!(sanitized_svc(&svc), sanitized_svc(&pristine_svc));
}

fn agent_of(workload: &Workload) -> &k8s_openapi::api::core::v1::Container {
    workload
        .containers()
        .iter()
        .find(|c| c.name == AGENT_CONTAINER_NAME)
        .expect("agent container present")
}

fn env_value<'a>(c: &'a k8s_openapi::api::core::v1::Container, name: &str) -> Option<&'a str> {
    c.env
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.as_deref())
}

fn target_port(service: &Service) -> Option<&IntOrString> {
    service.spec.as_ref()?.ports.as_ref()?.first()?.target_port.as_ref()
}

// =============================================================================
// Round-trip and idempotence
// =============================================================================

#[test]
fn round_trip_every_fixture() {
    for yaml in [
        NUMERIC_TARGET_PORT,
        DEFAULTED_TARGET_PORT,
        SYMBOLIC_TARGET_PORT,
        REPLICASET_FIXTURE,
        STATEFULSET_FIXTURE,
        ENV_FROM_AND_MOUNTS,
    ] {
        assert_round_trip(yaml);
    }
}

#[test]
fn install_is_idempotent() {
    let (mut wl, mut svc, port) = load(NUMERIC_TARGET_PORT);
    install(&mut wl, &mut svc, port.as_deref());
    let (wl_once, svc_once) = (wl.clone(), svc.clone());

    // Re-applying the persisted plans must change nothing.
    let plan: WorkloadActions =
        annotation::parse_plan(annotation::get(wl.metadata()).unwrap()).unwrap();
    plan.apply(&mut wl).unwrap();
    let svc_plan: ServiceActions =
        annotation::parse_plan(annotation::get(&svc.metadata).unwrap()).unwrap();
    svc_plan.apply(&mut svc).unwrap();

    assert_eq!(sanitized(&wl), sanitized(&wl_once));
    assert_eq!(sanitized_svc(&svc), sanitized_svc(&svc_once));
}

#[test]
fn undo_uses_only_the_annotation() {
    // `install` above already reparses nothing; this asserts the stronger
    // property that a *different* engine invocation, holding only the
    // mutated objects, can restore the originals.
    let (pristine_wl, pristine_svc, _) = load(SYMBOLIC_TARGET_PORT);
    let mut wl = pristine_wl.clone();
    let mut svc = pristine_svc.clone();
    install(&mut wl, &mut svc, None);

    // Serialize both mutated objects through JSON, as the API server
    // would, and restore from the parsed copies.
    let Workload::Deployment(d) = &wl else { panic!("fixture is a deployment") };
    let mut wl: Workload =
        Workload::Deployment(serde_json::from_str(&serde_json::to_string(d).unwrap()).unwrap());
    let mut svc: Service =
        serde_json::from_str(&serde_json::to_string(&svc).unwrap()).unwrap();

    uninstall(&mut wl, &mut svc);
    assert_eq!(sanitized(&wl), sanitized(&pristine_wl));
    assert_eq!(sanitized_svc(&svc), sanitized_svc(&pristine_svc));
}

// =============================================================================
// Installed-state shape
// =============================================================================

#[test]
fn numeric_target_port_is_rewritten_to_an_invented_name() {
    let (mut wl, mut svc, _) = load(NUMERIC_TARGET_PORT);
    install(&mut wl, &mut svc, None);

    // The service now targets the invented symbolic name
    assert_eq!(
        target_port(&svc),
        Some(&IntOrString::String("tel2px-8080".to_string()))
    );

    // The app container keeps its port untouched
    let app = &wl.containers()[0];
    assert_eq!(app.ports.as_ref().unwrap()[0].name.as_deref(), Some("http"));
    assert_eq!(app.ports.as_ref().unwrap()[0].container_port, 8080);

    // The agent owns the symbolic name on the fixed agent port
    let agent = agent_of(&wl);
    assert_eq!(agent.image.as_deref(), Some(AGENT_IMAGE));
    let port = &agent.ports.as_ref().unwrap()[0];
    assert_eq!(port.name.as_deref(), Some("tel2px-8080"));
    assert_eq!(port.container_port, AGENT_PORT);

    assert_eq!(env_value(agent, "APP_PORT"), Some("8080"));
    assert_eq!(env_value(agent, "AGENT_NAME"), Some("hello"));
    assert_eq!(env_value(agent, "TEL_APP_GREETING"), Some("moo"));
    assert_eq!(
        env_value(agent, "MANAGER_HOST"),
        Some("traffic-manager.ambassador")
    );
}

#[test]
fn defaulted_target_port_gains_a_symbolic_one() {
    let (mut wl, mut svc, _) = load(DEFAULTED_TARGET_PORT);
    assert_eq!(target_port(&svc), None);
    install(&mut wl, &mut svc, None);

    // Gained, not rewritten: the plan records the add so undo clears it
    assert_eq!(
        target_port(&svc),
        Some(&IntOrString::String("tel2px-80".to_string()))
    );
    let plan: ServiceActions =
        annotation::parse_plan(annotation::get(&svc.metadata).unwrap()).unwrap();
    assert!(plan.make_port_symbolic.is_none());
    assert!(plan.add_symbolic_port.is_some());
}

#[test]
fn adopted_symbolic_name_hides_the_app_port_and_rewrites_probes() {
    let (mut wl, mut svc, _) = load(SYMBOLIC_TARGET_PORT);
    let pristine_svc = svc.clone();
    install(&mut wl, &mut svc, None);

    // The service needed no edit and carries no annotation
    assert_eq!(svc, pristine_svc);
    assert_eq!(annotation::get(&svc.metadata), None);

    // The app port stepped aside under the hidden name
    let app = &wl.containers()[0];
    let app_port = &app.ports.as_ref().unwrap()[0];
    assert_eq!(app_port.name.as_deref(), Some("tel2mv-http"));
    assert!(app_port.name.as_ref().unwrap().len() <= 15);
    assert_eq!(app_port.container_port, 8080);

    // String probe references followed the rename; numeric ones did not
    assert_eq!(
        app.liveness_probe.as_ref().unwrap().http_get.as_ref().unwrap().port,
        IntOrString::String("tel2mv-http".to_string())
    );
    assert_eq!(
        app.readiness_probe.as_ref().unwrap().tcp_socket.as_ref().unwrap().port,
        IntOrString::String("tel2mv-http".to_string())
    );
    assert_eq!(
        app.startup_probe.as_ref().unwrap().http_get.as_ref().unwrap().port,
        IntOrString::Int(8080)
    );

    // The agent owns the adopted name
    let agent = agent_of(&wl);
    assert_eq!(
        agent.ports.as_ref().unwrap()[0].name.as_deref(),
        Some("http")
    );
    assert_eq!(env_value(agent, "AGENT_NAME"), Some("echo"));
}

#[test]
fn env_from_prefixes_and_mounts_are_remapped() {
    let (mut wl, mut svc, _) = load(ENV_FROM_AND_MOUNTS);
    install(&mut wl, &mut svc, None);

    let agent = agent_of(&wl);
    let env_from = agent.env_from.as_deref().unwrap();
    assert_eq!(env_from[0].prefix.as_deref(), Some("TEL_APP_"));
    assert_eq!(env_from[1].prefix.as_deref(), Some("TEL_APP_EXTRA_"));
    assert_eq!(
        env_from[1].secret_ref.as_ref().unwrap().name.as_deref(),
        Some("hello-secrets")
    );

    let mounts = agent.volume_mounts.as_deref().unwrap();
    assert_eq!(mounts[0].mount_path, "/tel_app_mounts/var/lib/hello");
    assert_eq!(mounts[1].mount_path, "/tel_app_mounts/etc/certs");
    assert_eq!(mounts[1].read_only, Some(true));

    assert_eq!(env_value(agent, "APP_MOUNTS"), Some("/tel_app_mounts"));
    assert_eq!(
        env_value(agent, "TEL_APP_TELEPRESENCE_MOUNTS"),
        Some("/var/lib/hello:/etc/certs")
    );
}

// =============================================================================
// Failure modes
// =============================================================================

#[test]
fn existing_agent_fails_planning_without_mutation() {
    let (mut wl, svc, _) = load(NUMERIC_TARGET_PORT);
    wl.containers_mut()
        .unwrap()
        .push(k8s_openapi::api::core::v1::Container {
            name: AGENT_CONTAINER_NAME.to_string(),
            ..Default::default()
        });
    let before = wl.clone();
    let err = plan_agent_injection(&wl, &svc, None, AGENT_IMAGE, MANAGER_NAMESPACE).unwrap_err();
    assert_eq!(err.code(), "ALREADY_EXISTS");
    assert_eq!(wl, before);
}

#[test]
fn two_ports_without_identifier_is_ambiguous() {
    let (wl, svc, _) = load(TWO_PORTS);
    let err = plan_agent_injection(&wl, &svc, None, AGENT_IMAGE, MANAGER_NAMESPACE).unwrap_err();
    assert_eq!(err.code(), "AMBIGUOUS_MATCH");

    // An identifier picks one and the install round-trips
    let mut wl = wl;
    let mut svc = svc;
    install(&mut wl, &mut svc, Some("web"));
    let plan: WorkloadActions =
        annotation::parse_plan(annotation::get(wl.metadata()).unwrap()).unwrap();
    assert_eq!(plan.referenced_service_port_name.as_deref(), Some("web"));
}

#[test]
fn plan_without_agent_stanza_undoes_cleanly() {
    let (pristine, _, _) = load(NUMERIC_TARGET_PORT);
    let mut wl = pristine.clone();
    let plan = WorkloadActions {
        version: tether::VERSION.to_string(),
        referenced_service: "hello".to_string(),
        ..Default::default()
    };
    annotation::set(wl.metadata_mut(), annotation::plan_json(&plan));

    let parsed: WorkloadActions =
        annotation::parse_plan(annotation::get(wl.metadata()).unwrap()).unwrap();
    parsed.undo(&mut wl).unwrap();
    annotation::clear(wl.metadata_mut());
    assert_eq!(sanitized(&wl), sanitized(&pristine));
}

#[test]
fn prior_minor_version_annotation_still_undoes() {
    let (pristine_wl, pristine_svc, _) = load(NUMERIC_TARGET_PORT);
    let mut wl = pristine_wl.clone();
    let mut svc = pristine_svc.clone();
    install(&mut wl, &mut svc, None);

    // Rewrite the persisted versions to an earlier minor of this major,
    // as an older client would have stamped them.
    let mut plan: WorkloadActions =
        annotation::parse_plan(annotation::get(wl.metadata()).unwrap()).unwrap();
    plan.version = prior_minor();
    annotation::set(wl.metadata_mut(), annotation::plan_json(&plan));
    let mut svc_plan: ServiceActions =
        annotation::parse_plan(annotation::get(&svc.metadata).unwrap()).unwrap();
    svc_plan.version = prior_minor();
    annotation::set(&mut svc.metadata, annotation::plan_json(&svc_plan));

    uninstall(&mut wl, &mut svc);
    assert_eq!(sanitized(&wl), sanitized(&pristine_wl));
    assert_eq!(sanitized_svc(&svc), sanitized_svc(&pristine_svc));
}

#[test]
fn foreign_major_annotation_is_refused() {
    let plan = WorkloadActions {
        version: "99.0.0".to_string(),
        referenced_service: "hello".to_string(),
        ..Default::default()
    };
    let err = annotation::ensure_compatible(&plan.version, &plan.unknown_fields).unwrap_err();
    assert_eq!(err.code(), "VERSION_SKEW");
}

fn prior_minor() -> String {
    let major = tether::VERSION.split('.').next().unwrap();
    format!("{major}.0.1")
}
