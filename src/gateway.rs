use std::fmt::Debug;
use std::pin::Pin;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncReadExt};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info};

use crate::error::{ExposerError, Result, classify_kube};

/* ============================= GATEWAY ============================= */

/// The only place that talks to the cluster API.
///
/// Everything above it works with typed `Api` handles scoped to the
/// namespace the analysis workloads live in; every error leaving this
/// module is tagged with the operation and the object identity.
#[derive(Clone)]
pub struct Gateway {
    client: Client,
    namespace: String,
}

impl Gateway {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn ingresses(&self) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn endpoints(&self) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /* ------------------------- pod I/O ------------------------- */

    /// Fetch a pod's log in one read.
    pub async fn pod_logs(&self, pod: &str, params: &LogParams) -> Result<String> {
        self.pods()
            .logs(pod, params)
            .await
            .map_err(|e| classify_kube("logs", format!("pod/{pod}"), e))
    }

    /// Open a streaming log read; the caller owns the stream's lifetime.
    pub async fn pod_log_stream(
        &self,
        pod: &str,
        params: &LogParams,
    ) -> Result<Pin<Box<dyn AsyncBufRead + Send>>> {
        let stream = self
            .pods()
            .log_stream(pod, params)
            .await
            .map_err(|e| classify_kube("log-stream", format!("pod/{pod}"), e))?;
        Ok(Box::pin(stream.compat()))
    }

    /// Run a command in a pod container and return its stdout.
    pub async fn pod_exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String> {
        let params = AttachParams::default()
            .container(container)
            .stdout(true)
            .stderr(false);
        let mut attached = self
            .pods()
            .exec(pod, command, &params)
            .await
            .map_err(|e| classify_kube("exec", format!("pod/{pod}"), e))?;

        let mut output = String::new();
        if let Some(mut stdout) = attached.stdout() {
            let mut buf = Vec::new();
            stdout
                .read_to_end(&mut buf)
                .await
                .map_err(|e| ExposerError::transient("exec", format!("pod/{pod}"), e))?;
            output = String::from_utf8_lossy(&buf).into_owned();
        }
        attached
            .join()
            .await
            .map_err(|e| ExposerError::transient("exec", format!("pod/{pod}"), e))?;
        Ok(output)
    }
}

/* ============================= SELECTOR OPS ============================= */

/// Identity tag used in error reporting: `kind/name` or `kind?selector`.
fn subject<K: Resource>(suffix: &str) -> String
where
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_lowercase();
    format!("{kind}/{suffix}")
}

/// List every object of one kind matching a label selector.
pub async fn list_by<K>(api: &Api<K>, selector: &str) -> Result<Vec<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let params = ListParams::default().labels(selector);
    let listed = api
        .list(&params)
        .await
        .map_err(|e| classify_kube("list", subject::<K>(selector), e))?;
    Ok(listed.items)
}

/// Delete every object of one kind matching a label selector.
///
/// Deleting by label is idempotent: a missing collection or object is
/// success, not an error.
pub async fn delete_all_by<K>(api: &Api<K>, selector: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let params = ListParams::default().labels(selector);
    match api
        .delete_collection(&DeleteParams::default(), &params)
        .await
    {
        Ok(_) => {
            debug!(selector = %selector, kind = %K::kind(&K::DynamicType::default()), "deleted_by_selector");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(classify_kube("delete", subject::<K>(selector), e)),
    }
}

/* ============================= UPSERT ============================= */

/// Create-or-update convergence primitive.
///
/// Specs are deterministic functions of the job, so a full replace is
/// always valid; the server `resourceVersion` is carried over and a 409
/// (optimistic-concurrency loss) is retried exactly once against a fresh
/// read.
pub async fn ensure<K>(api: &Api<K>, desired: K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or_else(|| ExposerError::fatal("ensure", subject::<K>("?"), "spec has no name"))?;

    match api.get(&name).await {
        Ok(existing) => replace_with_retry(api, &name, desired, existing.resource_version()).await,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            let created = api
                .create(&PostParams::default(), &desired)
                .await
                .map_err(|e| classify_kube("create", subject::<K>(&name), e))?;
            info!(name = %name, kind = %K::kind(&K::DynamicType::default()), "object_created");
            Ok(created)
        }
        Err(e) => Err(classify_kube("get", subject::<K>(&name), e)),
    }
}

/// Service variant of [`ensure`].
///
/// A service spec carries server-assigned immutable fields; they are
/// copied from the live object before the replace so the update is
/// accepted.
pub async fn ensure_service(api: &Api<Service>, mut desired: Service) -> Result<Service> {
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or_else(|| ExposerError::fatal("ensure", "service/?", "spec has no name"))?;

    match api.get(&name).await {
        Ok(existing) => {
            carry_service_immutables(&mut desired, &existing);
            replace_with_retry(api, &name, desired, existing.resource_version()).await
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            let created = api
                .create(&PostParams::default(), &desired)
                .await
                .map_err(|e| classify_kube("create", format!("service/{name}"), e))?;
            info!(name = %name, "service_created");
            Ok(created)
        }
        Err(e) => Err(classify_kube("get", format!("service/{name}"), e)),
    }
}

fn carry_service_immutables(desired: &mut Service, existing: &Service) {
    if let (Some(desired_spec), Some(existing_spec)) =
        (desired.spec.as_mut(), existing.spec.as_ref())
    {
        desired_spec.cluster_ip = existing_spec.cluster_ip.clone();
        desired_spec.cluster_ips = existing_spec.cluster_ips.clone();
    }
}

async fn replace_with_retry<K>(
    api: &Api<K>,
    name: &str,
    mut desired: K,
    resource_version: Option<String>,
) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    desired.meta_mut().resource_version = resource_version;

    match api.replace(name, &PostParams::default(), &desired).await {
        Ok(updated) => Ok(updated),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            let fresh = api
                .get(name)
                .await
                .map_err(|e| classify_kube("get", subject::<K>(name), e))?;
            desired.meta_mut().resource_version = fresh.resource_version();
            api.replace(name, &PostParams::default(), &desired)
                .await
                .map_err(|e| classify_kube("update", subject::<K>(name), e))
        }
        Err(e) => Err(classify_kube("update", subject::<K>(name), e)),
    }
}

/* ============================= TESTS ============================= */
