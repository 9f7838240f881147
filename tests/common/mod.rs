use vice_exposer::config::Settings;
use vice_exposer::job::Job;

pub fn make_test_job(invocation_id: &str, user_id: &str, image: &str, port: i32) -> Job {
    let (name, tag) = image.split_once(':').unwrap_or((image, "latest"));

    serde_json::from_value(serde_json::json!({
        "invocation_id": invocation_id,
        "user_id": user_id,
        "submitter": "ipcdev",
        "app_id": "app-1",
        "app_name": "jupyter",
        "name": "test analysis",
        "execution_target": "interapps",
        "output_dir": "/iplant/home/ipcdev/analyses/out",
        "steps": [{
            "component": {
                "container": {
                    "image": {"name": name, "tag": tag},
                    "uid": 1000,
                    "ports": [{"container_port": port}]
                }
            },
            "config": {
                "input": [
                    {"name": "data.csv", "value": "/iplant/home/ipcdev/data.csv"}
                ]
            }
        }]
    }))
    .unwrap()
}

pub fn make_test_settings() -> Settings {
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
