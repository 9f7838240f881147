use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::job::Job;
use crate::labels;

use super::{
    FILE_TRANSFER_PORT, FILE_TRANSFER_PORT_NAME, VICE_PROXY_PORT, VICE_PROXY_PORT_NAME,
    analysis_port_name, workload_name,
};

/* ============================= SERVICE ============================= */

/// Build the service fronting an analysis pod.
///
/// Always exposes the proxy (`tcp-proxy`) and the file-transfer side-car
/// (`tcp-input`); each declared analysis port gets a named port targeting
/// the container port by name.
pub fn service(job: &Job) -> Service {
    let mut ports = vec![
        named_port(VICE_PROXY_PORT_NAME, VICE_PROXY_PORT),
        named_port(FILE_TRANSFER_PORT_NAME, FILE_TRANSFER_PORT),
    ];

    for (i, container_port) in job.analysis_ports().into_iter().enumerate() {
        ports.push(named_port(&analysis_port_name(i), container_port));
    }

    Service {
        metadata: ObjectMeta {
            name: Some(workload_name(job)),
            labels: Some(labels::label_set(job)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                labels::EXTERNAL_ID.to_string(),
                job.invocation_id.clone(),
            )])),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn named_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::String(name.to_string())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/* ============================= TESTS ============================= */
