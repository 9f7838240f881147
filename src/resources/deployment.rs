use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, CSIVolumeSource, Capabilities, ConfigMapVolumeSource, Container, ContainerPort,
    EmptyDirVolumeSource, EnvVar, HTTPGetAction, LocalObjectReference, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::Settings;
use crate::error::Result;
use crate::job::Job;
use crate::labels;

use super::{
    ANALYSIS_CONTAINER, EXCLUDES_FILE_NAME, EXCLUDES_MOUNT_PATH, FILE_TRANSFER_CONTAINER,
    FILE_TRANSFER_INIT_CONTAINER, FILE_TRANSFER_PORT, FILE_TRANSFER_PORT_NAME,
    INPUT_PATH_LIST_FILE_NAME, INPUT_PATHS_MOUNT_PATH, PROXY_CONTAINER, TRANSFER_MOUNT_PATH,
    TRANSFER_VOLUME, VICE_PROXY_PORT, VICE_PROXY_PORT_NAME, analysis_port_name,
    excludes_configmap_name, file_transfer_args, input_path_list_configmap_name, workload_name,
};

/* ============================= DEFAULTS ============================= */

const DEFAULT_CPU_LIMIT: f64 = 4.0;
const DEFAULT_MEMORY_LIMIT_BYTES: i64 = 8 * 1024 * 1024 * 1024;
const CPU_REQUEST: &str = "1";
const MEMORY_REQUEST: &str = "2Gi";

/// Capabilities the file-transfer containers drop.
const TRANSFER_DROPPED_CAPS: &[&str] = &[
    "SETPCAP",
    "AUDIT_WRITE",
    "KILL",
    "SETGID",
    "SETUID",
    "NET_BIND_SERVICE",
    "SYS_CHROOT",
    "SETFCAP",
    "FSETID",
    "NET_RAW",
    "MKNOD",
];

/* ============================= DEPLOYMENT ============================= */

/// Build the single-replica deployment that runs an analysis.
///
/// The pod carries three containers (proxy, file-transfer side-car, the
/// analysis itself) plus an init container that performs the pre-run
/// download. Everything is deterministic from `(job, settings)`.
pub fn deployment(job: &Job, settings: &Settings) -> Result<Deployment> {
    let container = job.container()?;
    let uid = container.uid;

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(workload_name(job)),
            labels: Some(labels::label_set(job)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    labels::EXTERNAL_ID.to_string(),
                    job.invocation_id.clone(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels::label_set(job)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    security_context: Some(PodSecurityContext {
                        run_as_user: Some(uid),
                        run_as_group: Some(uid),
                        fs_group: Some(uid),
                        ..Default::default()
                    }),
                    automount_service_account_token: Some(false),
                    affinity: Some(node_affinity(settings)),
                    tolerations: Some(vec![Toleration {
                        key: Some(settings.toleration_key.clone()),
                        operator: Some("Equal".to_string()),
                        value: Some(settings.toleration_value.clone()),
                        effect: Some(settings.toleration_effect.clone()),
                        ..Default::default()
                    }]),
                    image_pull_secrets: settings.image_pull_secret_name.as_ref().map(|name| {
                        vec![LocalObjectReference {
                            name: Some(name.clone()),
                        }]
                    }),
                    init_containers: Some(vec![file_transfer_container(job, settings, true)]),
                    containers: vec![
                        proxy_container(job, settings),
                        file_transfer_container(job, settings, false),
                        analysis_container(job, settings),
                    ],
                    volumes: Some(pod_volumes(job, settings)),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn node_affinity(settings: &Settings) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: settings.node_selector_key.clone(),
                        operator: "In".to_string(),
                        values: Some(vec![settings.node_selector_value.clone()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/* ============================= VOLUMES ============================= */

fn pod_volumes(job: &Job, settings: &Settings) -> Vec<Volume> {
    let mut volumes = vec![Volume {
        name: EXCLUDES_FILE_NAME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(excludes_configmap_name(&job.invocation_id)),
            ..Default::default()
        }),
        ..Default::default()
    }];

    if !job.inputs_without_tickets().is_empty() {
        volumes.push(Volume {
            name: INPUT_PATH_LIST_FILE_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(input_path_list_configmap_name(&job.invocation_id)),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    volumes.push(transfer_volume(job, settings));
    volumes
}

fn transfer_volume(job: &Job, settings: &Settings) -> Volume {
    if settings.use_csi_driver {
        Volume {
            name: TRANSFER_VOLUME.to_string(),
            csi: Some(CSIVolumeSource {
                driver: settings.csi_driver_name.clone(),
                volume_attributes: Some(BTreeMap::from([
                    ("user".to_string(), job.submitter.clone()),
                    ("invocation-id".to_string(), job.invocation_id.clone()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: TRANSFER_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    }
}

fn transfer_mounts(job: &Job) -> Vec<VolumeMount> {
    let mut mounts = vec![VolumeMount {
        name: EXCLUDES_FILE_NAME.to_string(),
        mount_path: EXCLUDES_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }];

    if !job.inputs_without_tickets().is_empty() {
        mounts.push(VolumeMount {
            name: INPUT_PATH_LIST_FILE_NAME.to_string(),
            mount_path: INPUT_PATHS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    mounts.push(VolumeMount {
        name: TRANSFER_VOLUME.to_string(),
        mount_path: TRANSFER_MOUNT_PATH.to_string(),
        read_only: Some(false),
        ..Default::default()
    });

    mounts
}

/* ============================= CONTAINERS ============================= */

/// The porklock-based file-transfer container.
///
/// Serves the staging protocol on port 60001; in init mode it runs the
/// pre-run download with `--no-service` and exits before the pod starts.
fn file_transfer_container(job: &Job, settings: &Settings, init: bool) -> Container {
    let name = if init {
        FILE_TRANSFER_INIT_CONTAINER
    } else {
        FILE_TRANSFER_CONTAINER
    };

    Container {
        name: name.to_string(),
        image: Some(settings.porklock_image_ref()),
        command: Some(vec!["vice-file-transfers".to_string()]),
        args: Some(file_transfer_args(job, init)),
        ports: (!init).then(|| {
            vec![ContainerPort {
                container_port: FILE_TRANSFER_PORT,
                name: Some(FILE_TRANSFER_PORT_NAME.to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]
        }),
        volume_mounts: Some(transfer_mounts(job)),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                drop: Some(
                    TRANSFER_DROPPED_CAPS
                        .iter()
                        .map(|c| c.to_string())
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn proxy_container(job: &Job, settings: &Settings) -> Container {
    let backend_port = first_analysis_port(job).unwrap_or(8888);
    let frontend = labels::frontend_url(
        &settings.frontend_base_url,
        &job.user_id,
        &job.invocation_id,
    );

    Container {
        name: PROXY_CONTAINER.to_string(),
        image: Some(settings.vice_proxy_image.clone()),
        args: Some(vec![
            "--listen-port".to_string(),
            VICE_PROXY_PORT.to_string(),
            "--backend-url".to_string(),
            format!("http://localhost:{backend_port}"),
            "--ws-backend-url".to_string(),
            format!("ws://localhost:{backend_port}"),
            "--frontend-url".to_string(),
            frontend,
            "--external-id".to_string(),
            job.invocation_id.clone(),
            "--get-analysis-id-base-url".to_string(),
            settings.get_analysis_id_service.clone(),
            "--check-resource-access-base-url".to_string(),
            settings.check_resource_access_service.clone(),
            "--cas-base-url".to_string(),
            settings.cas_base_url.clone(),
            "--keycloak-base-url".to_string(),
            settings.keycloak_base_url.clone(),
            "--keycloak-realm".to_string(),
            settings.keycloak_realm.clone(),
            "--keycloak-client-id".to_string(),
            settings.keycloak_client_id.clone(),
            "--keycloak-client-secret".to_string(),
            settings.keycloak_client_secret.clone(),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: VICE_PROXY_PORT,
            name: Some(VICE_PROXY_PORT_NAME.to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn analysis_container(job: &Job, settings: &Settings) -> Container {
    // job.container() was validated by the caller; an empty steps list
    // cannot reach this point.
    let spec = &job.steps[0].component.container;

    let mut env: Vec<EnvVar> = job
        .environment
        .iter()
        .map(|(k, v)| env_var(k, v))
        .collect();
    env.sort_by(|a, b| a.name.cmp(&b.name));
    env.push(env_var(
        "REDIRECT_URL",
        &labels::frontend_url(
            &settings.frontend_base_url,
            &job.user_id,
            &job.invocation_id,
        ),
    ));
    env.push(env_var("IPLANT_USER", &job.submitter));
    env.push(env_var("IPLANT_EXECUTION_ID", &job.invocation_id));

    let ports: Vec<ContainerPort> = spec
        .ports
        .iter()
        .enumerate()
        .map(|(i, p)| ContainerPort {
            container_port: p.container_port,
            name: Some(analysis_port_name(i)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    Container {
        name: ANALYSIS_CONTAINER.to_string(),
        image: Some(spec.image_ref()),
        command: spec.entrypoint.clone().map(|e| vec![e]),
        args: Some(job.steps[0].arguments()),
        env: Some(env),
        ports: (!ports.is_empty()).then_some(ports),
        resources: Some(analysis_resources(job)),
        readiness_probe: first_analysis_port(job).map(readiness_probe),
        volume_mounts: Some(vec![VolumeMount {
            name: TRANSFER_VOLUME.to_string(),
            mount_path: TRANSFER_MOUNT_PATH.to_string(),
            read_only: Some(false),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

pub fn first_analysis_port(job: &Job) -> Option<i32> {
    job.analysis_ports().first().copied()
}

fn readiness_probe(port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        timeout_seconds: Some(30),
        period_seconds: Some(31),
        failure_threshold: Some(10),
        ..Default::default()
    }
}

/* ============================= RESOURCES ============================= */

fn analysis_resources(job: &Job) -> ResourceRequirements {
    let spec = &job.steps[0].component.container;

    let cpu = cpu_quantity(spec.max_cpu_cores.unwrap_or(DEFAULT_CPU_LIMIT));
    let memory = spec
        .memory_limit
        .unwrap_or(DEFAULT_MEMORY_LIMIT_BYTES)
        .to_string();

    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(CPU_REQUEST.to_string())),
            ("memory".to_string(), Quantity(MEMORY_REQUEST.to_string())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu)),
            ("memory".to_string(), Quantity(memory)),
        ])),
        ..Default::default()
    }
}

/// Format a core count as a Kubernetes quantity, keeping whole numbers
/// free of a trailing `.0`.
fn cpu_quantity(cores: f64) -> String {
    if cores.fract() == 0.0 {
        format!("{}", cores as i64)
    } else {
        format!("{cores}")
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::super::fixtures::{test_job, test_settings};
    use super::*;

    fn built() -> Deployment {
        deployment(&test_job(), &test_settings()).unwrap()
    }

    fn pod_spec(d: &Deployment) -> &PodSpec {
        d.spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
    }

    // ── shape ──

    #[test]
    fn test_deployment_named_after_invocation() {
        let d = built();
        assert_eq!(d.metadata.name.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_single_replica() {
        let d = built();
        assert_eq!(d.spec.as_ref().unwrap().replicas, Some(1));
    }

    #[test]
    fn test_selector_is_external_id() {
        let d = built();
        let selector = d.spec.as_ref().unwrap().selector.match_labels.as_ref().unwrap();
        assert_eq!(selector.len(), 1);
        assert_eq!(selector["external-id"], "abc123");
    }

    #[test]
    fn test_template_carries_full_label_set() {
        let d = built();
        let labels = d
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(labels["app-type"], "interactive");
        assert_eq!(labels["external-id"], "abc123");
        assert_eq!(labels["username"], "ipcdev");
    }

    // ── pod security ──

    #[test]
    fn test_security_context_pins_uid() {
        let d = built();
        let sc = pod_spec(&d).security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_user, Some(1000));
        assert_eq!(sc.run_as_group, Some(1000));
        assert_eq!(sc.fs_group, Some(1000));
    }

    #[test]
    fn test_service_account_token_not_mounted() {
        let d = built();
        assert_eq!(pod_spec(&d).automount_service_account_token, Some(false));
    }

    #[test]
    fn test_node_affinity_and_toleration() {
        let d = built();
        let spec = pod_spec(&d);
        let terms = &spec
            .affinity
            .as_ref()
            .unwrap()
            .node_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms;
        let expr = &terms[0].match_expressions.as_ref().unwrap()[0];
        assert_eq!(expr.key, "vice");
        assert_eq!(expr.values.as_ref().unwrap(), &vec!["true".to_string()]);

        let toleration = &spec.tolerations.as_ref().unwrap()[0];
        assert_eq!(toleration.key.as_deref(), Some("vice"));
        assert_eq!(toleration.effect.as_deref(), Some("NoSchedule"));
    }

    // ── containers ──

    #[test]
    fn test_container_names_and_order() {
        let d = built();
        let names: Vec<&str> = pod_spec(&d)
            .containers
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["vice-proxy", "input-files", "analysis"]);
    }

    #[test]
    fn test_init_container_runs_no_service() {
        let d = built();
        let init = &pod_spec(&d).init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, "input-files-init");
        assert_eq!(
            init.args.as_ref().unwrap().last().unwrap(),
            "--no-service"
        );
        assert!(init.ports.is_none());
    }

    #[test]
    fn test_sidecar_has_no_no_service_flag() {
        let d = built();
        let sidecar = &pod_spec(&d).containers[1];
        assert!(!sidecar.args.as_ref().unwrap().contains(&"--no-service".to_string()));
        let port = &sidecar.ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 60001);
        assert_eq!(port.name.as_deref(), Some("tcp-input"));
    }

    #[test]
    fn test_transfer_capabilities_dropped() {
        let d = built();
        let init = &pod_spec(&d).init_containers.as_ref().unwrap()[0];
        let dropped = init
            .security_context
            .as_ref()
            .unwrap()
            .capabilities
            .as_ref()
            .unwrap()
            .drop
            .as_ref()
            .unwrap();
        assert_eq!(dropped.len(), 11);
        assert!(dropped.contains(&"MKNOD".to_string()));
        assert!(dropped.contains(&"NET_BIND_SERVICE".to_string()));
    }

    #[test]
    fn test_transfer_mounts() {
        let d = built();
        let sidecar = &pod_spec(&d).containers[1];
        let mounts = sidecar.volume_mounts.as_ref().unwrap();
        let by_path: Vec<(&str, Option<bool>)> = mounts
            .iter()
            .map(|m| (m.mount_path.as_str(), m.read_only))
            .collect();
        assert!(by_path.contains(&("/excludes", Some(true))));
        assert!(by_path.contains(&("/input-paths", Some(true))));
        assert!(by_path.contains(&("/input-files", Some(false))));
    }

    #[test]
    fn test_proxy_container_port_and_backend() {
        let d = built();
        let proxy = &pod_spec(&d).containers[0];
        let port = &proxy.ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 8080);
        assert_eq!(port.name.as_deref(), Some("tcp-proxy"));

        let args = proxy.args.as_ref().unwrap();
        assert!(args.contains(&"http://localhost:8888".to_string()));
        let frontend = labels::frontend_url("https://cyverse.run", "u1", "abc123");
        assert!(args.contains(&frontend));
    }

    #[test]
    fn test_analysis_container_env() {
        let mut job = test_job();
        job.environment
            .insert("SHINY_PORT".to_string(), "8888".to_string());
        let d = deployment(&job, &test_settings()).unwrap();
        let analysis = &pod_spec(&d).containers[2];
        let env = analysis.env.as_ref().unwrap();

        let get = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };
        assert_eq!(get("IPLANT_USER").as_deref(), Some("ipcdev"));
        assert_eq!(get("IPLANT_EXECUTION_ID").as_deref(), Some("abc123"));
        assert_eq!(get("SHINY_PORT").as_deref(), Some("8888"));
        assert!(get("REDIRECT_URL").unwrap().starts_with("https://a"));
    }

    #[test]
    fn test_analysis_readiness_probe() {
        let d = built();
        let probe = pod_spec(&d).containers[2].readiness_probe.as_ref().unwrap();
        let get = probe.http_get.as_ref().unwrap();
        assert_eq!(get.path.as_deref(), Some("/"));
        assert_eq!(get.port, IntOrString::Int(8888));
        assert_eq!(probe.timeout_seconds, Some(30));
        assert_eq!(probe.period_seconds, Some(31));
        assert_eq!(probe.failure_threshold, Some(10));
    }

    #[test]
    fn test_analysis_resource_defaults() {
        let d = built();
        let resources = pod_spec(&d).containers[2].resources.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(limits["cpu"].0, "4");
        assert_eq!(limits["memory"].0, (8_i64 * 1024 * 1024 * 1024).to_string());
        assert_eq!(requests["cpu"].0, "1");
        assert_eq!(requests["memory"].0, "2Gi");
    }

    #[test]
    fn test_analysis_resource_overrides() {
        let mut job = test_job();
        job.steps[0].component.container.max_cpu_cores = Some(2.5);
        job.steps[0].component.container.memory_limit = Some(1024);
        let d = deployment(&job, &test_settings()).unwrap();
        let limits = pod_spec(&d).containers[2]
            .resources
            .as_ref()
            .unwrap()
            .limits
            .as_ref()
            .unwrap();
        assert_eq!(limits["cpu"].0, "2.5");
        assert_eq!(limits["memory"].0, "1024");
    }

    // ── volumes ──

    #[test]
    fn test_volumes_reference_configmaps() {
        let d = built();
        let volumes = pod_spec(&d).volumes.as_ref().unwrap();
        let cm_names: Vec<String> = volumes
            .iter()
            .filter_map(|v| v.config_map.as_ref())
            .filter_map(|cm| cm.name.clone())
            .collect();
        assert!(cm_names.contains(&"abc123-excludes-file".to_string()));
        assert!(cm_names.contains(&"abc123-input-path-list".to_string()));
    }

    #[test]
    fn test_no_input_path_volume_without_plain_inputs() {
        let mut job = test_job();
        job.steps[0].config.input.retain(|i| !i.ticket.is_empty());
        let d = deployment(&job, &test_settings()).unwrap();
        let volumes = pod_spec(&d).volumes.as_ref().unwrap();
        assert!(
            !volumes
                .iter()
                .any(|v| v.name == INPUT_PATH_LIST_FILE_NAME)
        );
    }

    #[test]
    fn test_transfer_volume_empty_dir_by_default() {
        let d = built();
        let volume = pod_spec(&d)
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == TRANSFER_VOLUME)
            .unwrap()
            .clone();
        assert!(volume.empty_dir.is_some());
        assert!(volume.csi.is_none());
    }

    #[test]
    fn test_transfer_volume_csi_when_enabled() {
        let mut settings = test_settings();
        settings.use_csi_driver = true;
        let d = deployment(&test_job(), &settings).unwrap();
        let volume = pod_spec(&d)
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == TRANSFER_VOLUME)
            .unwrap()
            .clone();
        let csi = volume.csi.as_ref().unwrap();
        assert_eq!(csi.driver, "irods.csi.cyverse.org");
        assert!(volume.empty_dir.is_none());
    }

    #[test]
    fn test_image_pull_secret_wired() {
        let mut settings = test_settings();
        settings.image_pull_secret_name = Some("registry-creds".to_string());
        let d = deployment(&test_job(), &settings).unwrap();
        let secrets = pod_spec(&d).image_pull_secrets.as_ref().unwrap();
        assert_eq!(secrets[0].name.as_deref(), Some("registry-creds"));
    }

    // ── cpu formatting ──

    #[test]
    fn test_cpu_quantity_whole() {
        assert_eq!(cpu_quantity(4.0), "4");
    }

    #[test]
    fn test_cpu_quantity_fractional() {
        assert_eq!(cpu_quantity(2.5), "2.5");
    }
}
