pub mod configmap;
pub mod deployment;
pub mod ingress;
pub mod service;

use crate::job::Job;

/* ============================= FIXED PORTS ============================= */

/// Port the authenticating proxy listens on.
pub const VICE_PROXY_PORT: i32 = 8080;
pub const VICE_PROXY_PORT_NAME: &str = "tcp-proxy";

/// Port the file-transfer side-car listens on.
pub const FILE_TRANSFER_PORT: i32 = 60001;
pub const FILE_TRANSFER_PORT_NAME: &str = "tcp-input";

/* ============================= CONTAINER NAMES ============================= */

pub const ANALYSIS_CONTAINER: &str = "analysis";
pub const PROXY_CONTAINER: &str = "vice-proxy";
pub const FILE_TRANSFER_CONTAINER: &str = "input-files";
pub const FILE_TRANSFER_INIT_CONTAINER: &str = "input-files-init";

/* ============================= MOUNT PATHS ============================= */

pub const EXCLUDES_MOUNT_PATH: &str = "/excludes";
pub const EXCLUDES_FILE_NAME: &str = "excludes-file";
pub const INPUT_PATHS_MOUNT_PATH: &str = "/input-paths";
pub const INPUT_PATH_LIST_FILE_NAME: &str = "input-path-list";
pub const TICKET_PATH_LIST_FILE_NAME: &str = "ticket-input-paths";
pub const TRANSFER_MOUNT_PATH: &str = "/input-files";
pub const TRANSFER_VOLUME: &str = "input-files";

/* ============================= OBJECT NAMES ============================= */

/// Deployment, service and ingress all carry the invocation id as name.
pub fn workload_name(job: &Job) -> String {
    job.invocation_id.clone()
}

pub fn excludes_configmap_name(invocation_id: &str) -> String {
    format!("{invocation_id}-{EXCLUDES_FILE_NAME}")
}

pub fn input_path_list_configmap_name(invocation_id: &str) -> String {
    format!("{invocation_id}-{INPUT_PATH_LIST_FILE_NAME}")
}

/// Service port name for the n-th declared analysis port.
pub fn analysis_port_name(index: usize) -> String {
    format!("a-{index}")
}

/* ============================= TRANSFER COMMAND ============================= */

/// Argument list for the file-transfer process.
///
/// The side-car runs it as a service on [`FILE_TRANSFER_PORT`]; the init
/// container runs the same command with `--no-service` appended so it
/// performs the pre-run download and exits.
pub fn file_transfer_args(job: &Job, no_service: bool) -> Vec<String> {
    let mut args = vec![
        "--listen-port".to_string(),
        FILE_TRANSFER_PORT.to_string(),
        "--user".to_string(),
        job.submitter.clone(),
        "--invocation-id".to_string(),
        job.invocation_id.clone(),
        "--excludes-file".to_string(),
        format!("{EXCLUDES_MOUNT_PATH}/{EXCLUDES_FILE_NAME}"),
        "--destination".to_string(),
        TRANSFER_MOUNT_PATH.to_string(),
    ];

    // Path-list files ride in one config map whose presence is keyed on
    // the without-ticket inputs; the flags must match what is mounted.
    if !job.inputs_without_tickets().is_empty() {
        args.push("--path-list".to_string());
        args.push(format!(
            "{INPUT_PATHS_MOUNT_PATH}/{INPUT_PATH_LIST_FILE_NAME}"
        ));

        if !job.inputs_with_tickets().is_empty() {
            args.push("--ticket-path-list".to_string());
            args.push(format!(
                "{INPUT_PATHS_MOUNT_PATH}/{TICKET_PATH_LIST_FILE_NAME}"
            ));
        }
    }
    if !job.output_dir.is_empty() {
        args.push("--output-dir".to_string());
        args.push(job.output_dir.clone());
    }

    if no_service {
        args.push("--no-service".to_string());
    }

    args
}

/* ============================= TEST FIXTURES ============================= */

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::config::Settings;
    use crate::job::Job;

    pub(crate) fn test_settings() -> Settings {
        serde_yaml::from_str(
            r#"
namespace: de
vice_namespace: vice-apps
porklock_image: discoenv/porklock
porklock_tag: "4.2"
vice_proxy_image: discoenv/vice-proxy
cas_base_url: https://cas.example.org/cas
frontend_base_url: https://cyverse.run
get_analysis_id_service: http://get-analysis-id
check_resource_access_service: http://check-resource-access
apps_service_base_url: http://apps
job_status_url: http://job-status-listener/status
permissions_url: http://permissions
keycloak_base_url: https://keycloak.example.org
keycloak_realm: de
keycloak_client_id: vice
keycloak_client_secret: s3cr3t
user_suffix: "@iplantcollaborative.org"
"#,
        )
        .unwrap()
    }

    pub(crate) fn test_job() -> Job {
        serde_json::from_value(serde_json::json!({
            "invocation_id": "abc123",
            "user_id": "u1",
            "submitter": "ipcdev",
            "app_id": "app-1",
            "app_name": "jupyter",
            "name": "my analysis",
            "execution_target": "interapps",
            "output_dir": "/iplant/home/ipcdev/analyses/out",
            "steps": [{
                "component": {
                    "container": {
                        "image": {"name": "demo", "tag": "1.0"},
                        "uid": 1000,
                        "ports": [{"container_port": 8888}]
                    }
                },
                "config": {
                    "input": [
                        {"name": "genome.fa", "value": "/iplant/home/ipcdev/genome.fa"},
                        {"name": "shared.csv", "value": "/iplant/home/other/shared.csv", "ticket": "t-42"}
                    ]
                }
            }]
        }))
        .unwrap()
    }
}

/* ============================= TESTS ============================= */
