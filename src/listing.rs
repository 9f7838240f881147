use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressRule};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;

use crate::error::Result;
use crate::gateway::{Gateway, list_by};
use crate::labels;
use crate::resources::ANALYSIS_CONTAINER;

/* ============================= PROJECTED VIEWS ============================= */

/// Identity shared by every projected object.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetaInfo {
    pub name: String,
    pub namespace: String,
    #[serde(rename = "analysis-name")]
    pub analysis_name: String,
    #[serde(rename = "app-name")]
    pub app_name: String,
    #[serde(rename = "app-id")]
    pub app_id: String,
    #[serde(rename = "external-id")]
    pub external_id: String,
    #[serde(rename = "user-id")]
    pub user_id: String,
    pub username: String,
    #[serde(rename = "creation-timestamp")]
    pub creation_timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct DeploymentInfo {
    #[serde(flatten)]
    pub meta: MetaInfo,
    pub image: String,
    pub command: Vec<String>,
    pub port: Option<i32>,
    pub user: Option<i64>,
    pub group: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PodInfo {
    #[serde(flatten)]
    pub meta: MetaInfo,
    pub phase: String,
}

#[derive(Debug, Serialize)]
pub struct ServicePortInfo {
    pub name: Option<String>,
    #[serde(rename = "node-port")]
    pub node_port: Option<i32>,
    #[serde(rename = "target-port")]
    pub target_port: Option<i32>,
    #[serde(rename = "target-port-name")]
    pub target_port_name: Option<String>,
    pub port: i32,
    pub protocol: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    #[serde(flatten)]
    pub meta: MetaInfo,
    pub ports: Vec<ServicePortInfo>,
}

#[derive(Debug, Serialize)]
pub struct IngressInfo {
    #[serde(flatten)]
    pub meta: MetaInfo,
    pub rules: Vec<IngressRule>,
    #[serde(rename = "default-backend")]
    pub default_backend: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigMapInfo {
    #[serde(flatten)]
    pub meta: MetaInfo,
    pub data: BTreeMap<String, String>,
}

/// Aggregate view across every kind the exposer owns.
#[derive(Debug, Serialize)]
pub struct ViceListing {
    pub deployments: Vec<DeploymentInfo>,
    pub pods: Vec<PodInfo>,
    pub configmaps: Vec<ConfigMapInfo>,
    pub services: Vec<ServiceInfo>,
    pub ingresses: Vec<IngressInfo>,
}

/* ============================= PROJECTIONS ============================= */

fn meta_info(meta: &ObjectMeta) -> MetaInfo {
    let label = |key: &str| {
        meta.labels
            .as_ref()
            .and_then(|l| l.get(key))
            .cloned()
            .unwrap_or_default()
    };

    MetaInfo {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        analysis_name: label(labels::ANALYSIS_NAME),
        app_name: label(labels::APP_NAME),
        app_id: label(labels::APP_ID),
        external_id: label(labels::EXTERNAL_ID),
        user_id: label(labels::USER_ID),
        username: label(labels::USERNAME),
        creation_timestamp: meta
            .creation_timestamp
            .as_ref()
            .map(|t| t.0.to_rfc3339())
            .unwrap_or_default(),
    }
}

pub fn deployment_info(deployment: &Deployment) -> DeploymentInfo {
    let pod_spec = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref());

    let analysis = pod_spec.and_then(|s| {
        s.containers
            .iter()
            .find(|c| c.name == ANALYSIS_CONTAINER)
    });

    let mut command = Vec::new();
    if let Some(c) = analysis {
        command.extend(c.command.clone().unwrap_or_default());
        command.extend(c.args.clone().unwrap_or_default());
    }

    let security = pod_spec.and_then(|s| s.security_context.as_ref());

    DeploymentInfo {
        meta: meta_info(&deployment.metadata),
        image: analysis
            .and_then(|c| c.image.clone())
            .unwrap_or_default(),
        command,
        port: analysis
            .and_then(|c| c.ports.as_ref())
            .and_then(|p| p.first())
            .map(|p| p.container_port),
        user: security.and_then(|s| s.run_as_user),
        group: security.and_then(|s| s.run_as_group),
    }
}

pub fn pod_info(pod: &Pod) -> PodInfo {
    PodInfo {
        meta: meta_info(&pod.metadata),
        phase: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default(),
    }
}

pub fn service_info(service: &Service) -> ServiceInfo {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| {
                    let (target_port, target_port_name) = match &p.target_port {
                        Some(IntOrString::Int(n)) => (Some(*n), None),
                        Some(IntOrString::String(name)) => (None, Some(name.clone())),
                        None => (None, None),
                    };
                    ServicePortInfo {
                        name: p.name.clone(),
                        node_port: p.node_port,
                        target_port,
                        target_port_name,
                        port: p.port,
                        protocol: p.protocol.clone(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    ServiceInfo {
        meta: meta_info(&service.metadata),
        ports,
    }
}

pub fn ingress_info(ingress: &Ingress) -> IngressInfo {
    let spec = ingress.spec.as_ref();

    let default_backend = spec
        .and_then(|s| s.default_backend.as_ref())
        .and_then(|b| b.service.as_ref())
        .map(|svc| {
            let port = svc
                .port
                .as_ref()
                .map(|p| {
                    p.name
                        .clone()
                        .or_else(|| p.number.map(|n| n.to_string()))
                        .unwrap_or_default()
                })
                .unwrap_or_default();
            format!("{}:{port}", svc.name)
        })
        .unwrap_or_default();

    IngressInfo {
        meta: meta_info(&ingress.metadata),
        rules: spec.and_then(|s| s.rules.clone()).unwrap_or_default(),
        default_backend,
    }
}

pub fn configmap_info(configmap: &ConfigMap) -> ConfigMapInfo {
    ConfigMapInfo {
        meta: meta_info(&configmap.metadata),
        data: configmap.data.clone().unwrap_or_default(),
    }
}

/* ============================= SERVICE ============================= */

/// Label-filtered reads over everything the exposer owns, projected into
/// the analysis-centric views above. The `app-type=interactive` filter is
/// always forced in and cannot be overridden by callers.
#[derive(Clone)]
pub struct ListingService {
    gateway: Gateway,
}

impl ListingService {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub async fn deployments(
        &self,
        filter: &BTreeMap<String, String>,
    ) -> Result<Vec<DeploymentInfo>> {
        let selector = labels::filter_selector(filter);
        let items = list_by(&self.gateway.deployments(), &selector).await?;
        Ok(items.iter().map(deployment_info).collect())
    }

    pub async fn pods(&self, filter: &BTreeMap<String, String>) -> Result<Vec<PodInfo>> {
        let selector = labels::filter_selector(filter);
        let items = list_by(&self.gateway.pods(), &selector).await?;
        Ok(items.iter().map(pod_info).collect())
    }

    pub async fn services(&self, filter: &BTreeMap<String, String>) -> Result<Vec<ServiceInfo>> {
        let selector = labels::filter_selector(filter);
        let items = list_by(&self.gateway.services(), &selector).await?;
        Ok(items.iter().map(service_info).collect())
    }

    pub async fn ingresses(&self, filter: &BTreeMap<String, String>) -> Result<Vec<IngressInfo>> {
        let selector = labels::filter_selector(filter);
        let items = list_by(&self.gateway.ingresses(), &selector).await?;
        Ok(items.iter().map(ingress_info).collect())
    }

    pub async fn configmaps(
        &self,
        filter: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMapInfo>> {
        let selector = labels::filter_selector(filter);
        let items = list_by(&self.gateway.config_maps(), &selector).await?;
        Ok(items.iter().map(configmap_info).collect())
    }

    pub async fn everything(&self, filter: &BTreeMap<String, String>) -> Result<ViceListing> {
        Ok(ViceListing {
            deployments: self.deployments(filter).await?,
            pods: self.pods(filter).await?,
            configmaps: self.configmaps(filter).await?,
            services: self.services(filter).await?,
            ingresses: self.ingresses(filter).await?,
        })
    }
}

/* ============================= TESTS ============================= */
