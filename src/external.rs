use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DeleteParams;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{Result, classify_kube};
use crate::gateway::{Gateway, ensure, ensure_service};

/* ============================= OPTIONS ============================= */

/// Request/response body for the generic service surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOptions {
    #[serde(default)]
    pub name: String,
    pub target_port: i32,
    pub listen_port: i32,
}

/// Request/response body for the generic endpoint surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointOptions {
    #[serde(default)]
    pub name: String,
    pub ip: String,
    pub port: i32,
}

/// Request/response body for the generic ingress surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressOptions {
    #[serde(default)]
    pub name: String,
    pub service: String,
    pub port: i32,
}

/* ============================= BUILDERS ============================= */

pub fn build_service(name: &str, opts: &ServiceOptions) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(format!("tcp-{}", opts.listen_port)),
                port: opts.listen_port,
                target_port: Some(IntOrString::Int(opts.target_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_endpoints(name: &str, opts: &EndpointOptions) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: opts.ip.clone(),
                ..Default::default()
            }]),
            ports: Some(vec![EndpointPort {
                port: opts.port,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

pub fn build_ingress(name: &str, opts: &IngressOptions, settings: &Settings) -> Ingress {
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: opts.service.clone(),
            port: Some(ServiceBackendPort {
                number: Some(opts.port),
                name: None,
            }),
        }),
        resource: None,
    };

    // Unmatched traffic lands on the configured landing-page backend.
    let default_backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: settings.vice_default_backend_service.clone(),
            port: Some(ServiceBackendPort {
                number: Some(settings.vice_default_backend_service_port),
                name: None,
            }),
        }),
        resource: None,
    };

    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            default_backend: Some(default_backend),
            rules: Some(vec![IngressRule {
                host: Some(name.to_string()),
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
    }
}

/* ============================= PROJECTIONS ============================= */

pub fn service_options(service: &Service) -> ServiceOptions {
    let port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|p| p.first());

    ServiceOptions {
        name: service.metadata.name.clone().unwrap_or_default(),
        listen_port: port.map(|p| p.port).unwrap_or_default(),
        target_port: port
            .and_then(|p| match &p.target_port {
                Some(IntOrString::Int(n)) => Some(*n),
                _ => None,
            })
            .unwrap_or_default(),
    }
}

pub fn endpoint_options(endpoints: &Endpoints) -> EndpointOptions {
    let subset = endpoints.subsets.as_ref().and_then(|s| s.first());

    EndpointOptions {
        name: endpoints.metadata.name.clone().unwrap_or_default(),
        ip: subset
            .and_then(|s| s.addresses.as_ref())
            .and_then(|a| a.first())
            .map(|a| a.ip.clone())
            .unwrap_or_default(),
        port: subset
            .and_then(|s| s.ports.as_ref())
            .and_then(|p| p.first())
            .map(|p| p.port)
            .unwrap_or_default(),
    }
}

pub fn ingress_options(ingress: &Ingress) -> IngressOptions {
    let backend = ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .and_then(|r| r.first())
        .and_then(|r| r.http.as_ref())
        .and_then(|h| h.paths.first())
        .and_then(|p| p.backend.service.as_ref());

    IngressOptions {
        name: ingress.metadata.name.clone().unwrap_or_default(),
        service: backend.map(|b| b.name.clone()).unwrap_or_default(),
        port: backend
            .and_then(|b| b.port.as_ref())
            .and_then(|p| p.number)
            .unwrap_or_default(),
    }
}

/* ============================= SERVICE ============================= */

/// CRUD pass-throughs for apps hosted outside the cluster, kept apart
/// from the analysis lifecycle. Objects live in the backend namespace.
#[derive(Clone)]
pub struct ExternalService {
    gateway: Gateway,
    settings: std::sync::Arc<Settings>,
}

impl ExternalService {
    pub fn new(client: kube::Client, settings: std::sync::Arc<Settings>) -> Self {
        let namespace = settings
            .vice_backend_namespace
            .clone()
            .unwrap_or_else(|| settings.namespace.clone());
        Self {
            gateway: Gateway::new(client, namespace),
            settings,
        }
    }

    pub async fn upsert_service(&self, name: &str, opts: &ServiceOptions) -> Result<ServiceOptions> {
        let applied = ensure_service(&self.gateway.services(), build_service(name, opts)).await?;
        Ok(service_options(&applied))
    }

    pub async fn get_service(&self, name: &str) -> Result<ServiceOptions> {
        let found = self
            .gateway
            .services()
            .get(name)
            .await
            .map_err(|e| classify_kube("get", format!("service/{name}"), e))?;
        Ok(service_options(&found))
    }

    pub async fn delete_service(&self, name: &str) -> Result<()> {
        match self
            .gateway
            .services()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(classify_kube("delete", format!("service/{name}"), e)),
        }
    }

    pub async fn upsert_endpoints(
        &self,
        name: &str,
        opts: &EndpointOptions,
    ) -> Result<EndpointOptions> {
        let applied = ensure(&self.gateway.endpoints(), build_endpoints(name, opts)).await?;
        Ok(endpoint_options(&applied))
    }

    pub async fn get_endpoints(&self, name: &str) -> Result<EndpointOptions> {
        let found = self
            .gateway
            .endpoints()
            .get(name)
            .await
            .map_err(|e| classify_kube("get", format!("endpoints/{name}"), e))?;
        Ok(endpoint_options(&found))
    }

    pub async fn delete_endpoints(&self, name: &str) -> Result<()> {
        match self
            .gateway
            .endpoints()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(classify_kube("delete", format!("endpoints/{name}"), e)),
        }
    }

    pub async fn upsert_ingress(&self, name: &str, opts: &IngressOptions) -> Result<IngressOptions> {
        let built = build_ingress(name, opts, &self.settings);
        let applied = ensure(&self.gateway.ingresses(), built).await?;
        Ok(ingress_options(&applied))
    }

    pub async fn get_ingress(&self, name: &str) -> Result<IngressOptions> {
        let found = self
            .gateway
            .ingresses()
            .get(name)
            .await
            .map_err(|e| classify_kube("get", format!("ingress/{name}"), e))?;
        Ok(ingress_options(&found))
    }

    pub async fn delete_ingress(&self, name: &str) -> Result<()> {
        match self
            .gateway
            .ingresses()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(classify_kube("delete", format!("ingress/{name}"), e)),
        }
    }
}

/* ============================= TESTS ============================= */
