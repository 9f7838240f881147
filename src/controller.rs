use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{ExposerError, Result, classify_kube};
use crate::gateway::{Gateway, delete_all_by, ensure, ensure_service, list_by};
use crate::http::{EXITS_TOTAL, LAUNCHES_TOTAL};
use crate::job::Job;
use crate::labels;
use crate::listing::{ListingService, ViceListing};
use crate::resources::{configmap, deployment, ingress, service};
use crate::staging::{Coordinator, Direction, pick_ready_pod};

/* ============================= LAUNCH REGISTRY ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Launching,
    Running,
    Draining,
}

/// Process-local record of where each analysis sits in its lifecycle.
///
/// The cluster stays the arbiter across processes; this registry only
/// serialises launch and exit within one process so an exit can cancel a
/// launch still in progress.
#[derive(Clone, Default)]
pub struct LaunchRegistry {
    inner: Arc<RwLock<HashMap<String, Phase>>>,
}

impl LaunchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, id: &str) -> Option<Phase> {
        self.read().get(id).copied()
    }

    /// A (re)launch always restarts the machine at Launching.
    pub fn begin_launch(&self, id: &str) {
        self.write().insert(id.to_string(), Phase::Launching);
    }

    /// Abort point between upsert steps: once an exit has taken the
    /// analysis out of Launching, the remaining upserts are rejected.
    pub fn ensure_launching(&self, id: &str) -> Result<()> {
        match self.phase(id) {
            Some(Phase::Launching) => Ok(()),
            _ => Err(ExposerError::not_found(format!(
                "launch of {id} was cancelled"
            ))),
        }
    }

    pub fn mark_running(&self, id: &str) {
        let mut held = self.write();
        if held.get(id) == Some(&Phase::Launching) {
            held.insert(id.to_string(), Phase::Running);
        }
    }

    pub fn begin_drain(&self, id: &str) {
        self.write().insert(id.to_string(), Phase::Draining);
    }

    /// Draining finished; the analysis is Absent again.
    pub fn clear(&self, id: &str) {
        self.write().remove(id);
    }

    /// Staging against an analysis that is draining in this process is
    /// rejected outright; anything else defers to the cluster.
    pub fn ensure_not_draining(&self, id: &str) -> Result<()> {
        if self.phase(id) == Some(Phase::Draining) {
            return Err(ExposerError::not_found(format!(
                "analysis {id} is shutting down"
            )));
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Phase>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Phase>> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/* ============================= TIME LIMITS ============================= */

/// Stamp the absolute time limit onto a deployment spec before it is
/// applied.
pub fn with_time_limit(deployment: &mut Deployment, epoch_seconds: i64) {
    deployment
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(labels::TIME_LIMIT.to_string(), epoch_seconds.to_string());
}

pub fn time_limit_of(deployment: &Deployment) -> Option<i64> {
    deployment
        .labels()
        .get(labels::TIME_LIMIT)
        .and_then(|v| v.parse().ok())
}

/// External ids whose deployments have outlived their time limit.
pub fn expired_external_ids(deployments: &[Deployment], now_epoch: i64) -> Vec<String> {
    deployments
        .iter()
        .filter(|d| time_limit_of(d).is_some_and(|limit| limit < now_epoch))
        .filter_map(|d| d.labels().get(labels::EXTERNAL_ID).cloned())
        .collect()
}

/* ============================= HOST LOOKUP ============================= */

/// True when this deployment's identity hashes to the given public host.
/// The subdomain is the join key back from a request host to an analysis.
pub fn host_matches(deployment: &Deployment, host: &str) -> bool {
    let obj_labels = deployment.labels();
    match (
        obj_labels.get(labels::USER_ID),
        obj_labels.get(labels::EXTERNAL_ID),
    ) {
        (Some(user_id), Some(external_id)) => labels::subdomain(user_id, external_id) == host,
        _ => false,
    }
}

pub fn find_by_host<'a>(deployments: &'a [Deployment], host: &str) -> Option<&'a Deployment> {
    deployments.iter().find(|d| host_matches(d, host))
}

/* ============================= RESPONSES ============================= */

#[derive(Debug, Serialize)]
pub struct UrlReady {
    pub ready: bool,
    #[serde(rename = "pod-phases")]
    pub pod_phases: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TimeLimit {
    #[serde(rename = "time-limit")]
    pub time_limit: i64,
}

/* ============================= CONTROLLER ============================= */

/// Orchestrates the per-analysis lifecycle: launch, staging triggers,
/// exit, save-and-exit and time limits.
#[derive(Clone)]
pub struct Controller {
    gateway: Gateway,
    settings: Arc<Settings>,
    staging: Coordinator,
    listing: ListingService,
    registry: LaunchRegistry,
}

impl Controller {
    pub fn new(gateway: Gateway, settings: Arc<Settings>) -> Self {
        Self {
            staging: Coordinator::new(gateway.clone()),
            listing: ListingService::new(gateway.clone()),
            registry: LaunchRegistry::new(),
            gateway,
            settings,
        }
    }

    pub fn listing(&self) -> &ListingService {
        &self.listing
    }

    pub fn registry(&self) -> &LaunchRegistry {
        &self.registry
    }

    /* ------------------------- launch ------------------------- */

    /// Materialise every owned object for a job. Idempotent: re-launching
    /// an already-running invocation re-applies the same specs.
    pub async fn launch(&self, job: &Job) -> Result<()> {
        job.validate()?;
        let id = job.invocation_id.as_str();
        self.registry.begin_launch(id);

        self.launch_objects(job).await?;

        self.registry.mark_running(id);
        LAUNCHES_TOTAL.inc();
        info!(external_id = %id, analysis = %job.name, "analysis_launched");
        Ok(())
    }

    /// Upsert ordering: excludes config map, input path list (optional),
    /// deployment, service, ingress. A failure aborts; nothing is rolled
    /// back, the next launch converges.
    async fn launch_objects(&self, job: &Job) -> Result<()> {
        let id = job.invocation_id.as_str();

        ensure_with_retry(&self.gateway.config_maps(), configmap::excludes_configmap(job)).await?;
        self.registry.ensure_launching(id)?;

        if let Some(cm) = configmap::input_path_list_configmap(job, &self.settings) {
            ensure_with_retry(&self.gateway.config_maps(), cm).await?;
            self.registry.ensure_launching(id)?;
        }

        let mut dep = deployment::deployment(job, &self.settings)?;
        with_time_limit(
            &mut dep,
            Utc::now().timestamp() + self.settings.default_time_limit_seconds,
        );
        ensure_with_retry(&self.gateway.deployments(), dep).await?;
        self.registry.ensure_launching(id)?;

        let svc = service::service(job);
        let services = self.gateway.services();
        match ensure_service(&services, svc.clone()).await {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "upsert_retrying");
                ensure_service(&services, svc.clone()).await?;
            }
            other => {
                other?;
            }
        }
        self.registry.ensure_launching(id)?;

        let ing = ingress::ingress(job, &svc)?;
        ensure_with_retry(&self.gateway.ingresses(), ing).await?;
        Ok(())
    }

    /* ------------------------- staging ------------------------- */

    pub async fn trigger_downloads(&self, id: &str, blocking: bool) -> Result<()> {
        self.registry.ensure_not_draining(id)?;
        self.staging.transfer(id, Direction::Download, blocking).await
    }

    pub async fn trigger_uploads(&self, id: &str, blocking: bool) -> Result<()> {
        self.registry.ensure_not_draining(id)?;
        self.staging.transfer(id, Direction::Upload, blocking).await
    }

    /* ------------------------- exit ------------------------- */

    /// Delete everything carrying the analysis's external id. Missing
    /// objects are ignored; calling this twice succeeds twice.
    pub async fn exit(&self, id: &str) -> Result<()> {
        self.registry.begin_drain(id);
        let selector = labels::external_id_selector(id);

        // Reverse of the launch ordering; routing dies first.
        delete_all_by(&self.gateway.ingresses(), &selector).await?;
        delete_all_by(&self.gateway.services(), &selector).await?;
        delete_all_by(&self.gateway.deployments(), &selector).await?;
        delete_all_by(&self.gateway.config_maps(), &selector).await?;

        self.registry.clear(id);
        EXITS_TOTAL.inc();
        info!(external_id = %id, "analysis_exited");
        Ok(())
    }

    /// Upload outputs, then tear down. Acknowledged asynchronously and
    /// not cancellable once the upload has begun. An upload failure leaves
    /// every object in place so the call can be retried.
    pub fn save_and_exit(&self, id: &str) {
        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            match this.staging.transfer(&id, Direction::Upload, true).await {
                Ok(()) => {
                    info!(external_id = %id, "save_and_exit_upload_done");
                    if let Err(e) = this.exit(&id).await {
                        warn!(external_id = %id, error = %e, "save_and_exit_teardown_failed");
                    }
                }
                Err(e) => {
                    warn!(external_id = %id, error = %e, "save_and_exit_upload_failed");
                }
            }
        });
    }

    /* ------------------------- time limits ------------------------- */

    pub async fn get_time_limit(&self, id: &str) -> Result<TimeLimit> {
        let dep = self.deployment_for(id).await?;
        let limit = time_limit_of(&dep).ok_or_else(|| {
            ExposerError::not_found(format!("deployment for {id} carries no time limit"))
        })?;
        Ok(TimeLimit { time_limit: limit })
    }

    /// Extend (or with a negative delta, shorten) the time limit.
    pub async fn set_time_limit(&self, id: &str, delta_seconds: i64) -> Result<TimeLimit> {
        let dep = self.deployment_for(id).await?;
        let name = dep.name_any();
        let current = time_limit_of(&dep).unwrap_or_else(|| Utc::now().timestamp());
        let updated = current + delta_seconds;

        let patch = serde_json::json!({
            "metadata": {
                "labels": { labels::TIME_LIMIT: updated.to_string() }
            }
        });
        self.gateway
            .deployments()
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify_kube("patch", format!("deployment/{name}"), e))?;

        info!(external_id = %id, time_limit = updated, "time_limit_updated");
        Ok(TimeLimit {
            time_limit: updated,
        })
    }

    async fn deployment_for(&self, id: &str) -> Result<Deployment> {
        let selector = labels::external_id_selector(id);
        let mut found = list_by(&self.gateway.deployments(), &selector).await?;
        found.pop().ok_or_else(|| {
            ExposerError::not_found(format!("no deployment with external-id {id}"))
        })
    }

    /* ------------------------- host lookups ------------------------- */

    /// Map a public subdomain host back to the owning external id.
    pub async fn external_id_for_host(&self, host: &str) -> Result<String> {
        let deployments =
            list_by(&self.gateway.deployments(), &labels::interactive_selector()).await?;
        find_by_host(&deployments, host)
            .and_then(|d| d.labels().get(labels::EXTERNAL_ID).cloned())
            .ok_or_else(|| ExposerError::not_found(format!("no analysis behind host {host}")))
    }

    /// Readiness of the app behind a host: the deployment has a ready
    /// replica and at least one pod reports ready.
    pub async fn url_ready(&self, host: &str) -> Result<UrlReady> {
        let id = self.external_id_for_host(host).await?;
        let selector = labels::external_id_selector(&id);

        let deployments = list_by(&self.gateway.deployments(), &selector).await?;
        let replica_ready = deployments.iter().any(|d| {
            d.status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0)
                > 0
        });

        let pods = list_by(&self.gateway.pods(), &selector).await?;
        let pod_phases: Vec<String> = pods
            .iter()
            .map(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_else(|| "Unknown".to_string())
            })
            .collect();
        let pod_ready = pick_ready_pod(pods).is_some();

        Ok(UrlReady {
            ready: replica_ready && pod_ready,
            pod_phases,
        })
    }

    /// Everything known about the analysis behind a host, merged across
    /// the owned kinds.
    pub async fn describe_host(&self, host: &str) -> Result<ViceListing> {
        let id = self.external_id_for_host(host).await?;
        let filter = std::collections::BTreeMap::from([(
            labels::EXTERNAL_ID.to_string(),
            id,
        )]);
        self.listing.everything(&filter).await
    }

    /* ------------------------- time-limit sweeper ------------------------- */

    async fn sweep_expired(&self) {
        let deployments =
            match list_by(&self.gateway.deployments(), &labels::interactive_selector()).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "time_limit_sweep_list_failed");
                    return;
                }
            };

        for id in expired_external_ids(&deployments, Utc::now().timestamp()) {
            info!(external_id = %id, "time_limit_exceeded");
            if let Err(e) = self.exit(&id).await {
                warn!(external_id = %id, error = %e, "time_limit_exit_failed");
            }
        }
    }
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically ends analyses whose time limit has passed.
pub async fn time_limit_sweeper(controller: Controller, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("time_limit_sweeper_stopped");
                return;
            }
            _ = sleep(SWEEP_INTERVAL) => {
                controller.sweep_expired().await;
            }
        }
    }
}

/* ============================= UPSERT RETRY ============================= */

/// One in-process retry for transient cluster failures; everything else
/// propagates.
async fn ensure_with_retry<K>(api: &Api<K>, desired: K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    match ensure(api, desired.clone()).await {
        Err(e) if e.is_transient() => {
            warn!(error = %e, "upsert_retrying");
            ensure(api, desired).await
        }
        other => other,
    }
}

/* ============================= TESTS ============================= */
