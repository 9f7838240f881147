use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::{ExposerError, Result};
use crate::job::Job;
use crate::labels;

use super::{VICE_PROXY_PORT_NAME, workload_name};

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const INGRESS_CLASS: &str = "nginx";

/* ============================= INGRESS ============================= */

/// Build the ingress that routes the analysis subdomain to the proxy.
///
/// The default backend is the service's `tcp-proxy` port; a service
/// without one cannot be exposed and construction fails.
pub fn ingress(job: &Job, service: &Service) -> Result<Ingress> {
    let service_name = service
        .metadata
        .name
        .clone()
        .ok_or_else(|| ExposerError::fatal("build-ingress", workload_name(job), "service has no name"))?;

    let has_proxy_port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .is_some_and(|ports| {
            ports
                .iter()
                .any(|p| p.name.as_deref() == Some(VICE_PROXY_PORT_NAME))
        });
    if !has_proxy_port {
        return Err(ExposerError::fatal(
            "build-ingress",
            format!("service/{service_name}"),
            format!("service exposes no port named {VICE_PROXY_PORT_NAME}"),
        ));
    }

    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: service_name,
            port: Some(ServiceBackendPort {
                name: Some(VICE_PROXY_PORT_NAME.to_string()),
                number: None,
            }),
        }),
        resource: None,
    };

    let host = labels::subdomain(&job.user_id, &job.invocation_id);

    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(workload_name(job)),
            labels: Some(labels::label_set(job)),
            annotations: Some(BTreeMap::from([(
                INGRESS_CLASS_ANNOTATION.to_string(),
                INGRESS_CLASS.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            default_backend: Some(backend.clone()),
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        backend,
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::super::fixtures::test_job;
    use super::super::service::service;
    use super::*;

    #[test]
    fn test_ingress_named_after_invocation() {
        let job = test_job();
        let ing = ingress(&job, &service(&job)).unwrap();
        assert_eq!(ing.metadata.name.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_nginx_class_annotation() {
        let job = test_job();
        let ing = ingress(&job, &service(&job)).unwrap();
        let annotations = ing.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["kubernetes.io/ingress.class"], "nginx");
    }

    #[test]
    fn test_default_backend_targets_proxy_port() {
        let job = test_job();
        let ing = ingress(&job, &service(&job)).unwrap();
        let backend = ing
            .spec
            .as_ref()
            .unwrap()
            .default_backend
            .as_ref()
            .unwrap()
            .service
            .as_ref()
            .unwrap();
        assert_eq!(backend.name, "abc123");
        assert_eq!(
            backend.port.as_ref().unwrap().name.as_deref(),
            Some("tcp-proxy")
        );
    }

    #[test]
    fn test_rule_host_is_subdomain() {
        let job = test_job();
        let ing = ingress(&job, &service(&job)).unwrap();
        let rule = &ing.spec.as_ref().unwrap().rules.as_ref().unwrap()[0];
        assert_eq!(
            rule.host.as_deref(),
            Some(labels::subdomain("u1", "abc123").as_str())
        );
        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/"));
        assert_eq!(path.path_type, "Prefix");
    }

    #[test]
    fn test_missing_proxy_port_fails() {
        let job = test_job();
        let mut svc = service(&job);
        svc.spec
            .as_mut()
            .unwrap()
            .ports
            .as_mut()
            .unwrap()
            .retain(|p| p.name.as_deref() != Some("tcp-proxy"));
        let err = ingress(&job, &svc).unwrap_err();
        assert!(matches!(err, ExposerError::Fatal { .. }));
    }

    #[test]
    fn test_full_label_set_on_ingress() {
        let job = test_job();
        let ing = ingress(&job, &service(&job)).unwrap();
        let labels = ing.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["external-id"], "abc123");
        assert_eq!(labels["app-type"], "interactive");
    }
}
