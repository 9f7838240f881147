use std::sync::Arc;

use axum::body::Body;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::LogParams;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::clients::{AppsService, authorized_external_ids};
use crate::error::{ExposerError, Result, classify_kube};
use crate::gateway::{Gateway, list_by};
use crate::labels;
use crate::resources::ANALYSIS_CONTAINER;

/* ============================= OPTIONS ============================= */

/// Log options as they arrive on the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogOpts {
    pub previous: Option<bool>,
    /// Relative window in seconds.
    pub since: Option<i64>,
    /// Absolute lower bound as Unix epoch seconds.
    #[serde(rename = "since-time")]
    pub since_time: Option<i64>,
    #[serde(rename = "tail-lines")]
    pub tail_lines: Option<i64>,
    pub timestamps: Option<bool>,
    pub follow: Option<bool>,
    pub container: Option<String>,
    /// Pod to read from; defaults to the oldest pod of the analysis.
    pub pod: Option<String>,
}

impl LogOpts {
    pub fn follow(&self) -> bool {
        self.follow.unwrap_or(false)
    }

    /// Translate to cluster log parameters. `since-time` is folded into a
    /// relative window against `now` (epoch seconds); an explicit `since`
    /// wins when both are present.
    pub fn to_log_params(&self, now: i64) -> LogParams {
        let since_seconds = self
            .since
            .or_else(|| self.since_time.map(|t| (now - t).max(0)));

        LogParams {
            container: Some(
                self.container
                    .clone()
                    .unwrap_or_else(|| ANALYSIS_CONTAINER.to_string()),
            ),
            follow: self.follow(),
            previous: self.previous.unwrap_or(false),
            since_seconds,
            tail_lines: self.tail_lines,
            timestamps: self.timestamps.unwrap_or(false),
            ..Default::default()
        }
    }
}

/* ============================= RESPONSES ============================= */

#[derive(Debug, Serialize)]
pub struct LogPayload {
    pub since_time: i64,
    pub lines: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PodName {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct PodListing {
    pub pods: Vec<PodName>,
}

/* ============================= OWNERSHIP ============================= */

/// A pod belongs to the caller when its `external-id` label matches one of
/// the ids the apps service handed back for them.
pub fn pod_owned_by(pod: &Pod, external_ids: &[String]) -> bool {
    pod.labels()
        .get(labels::EXTERNAL_ID)
        .is_some_and(|id| external_ids.iter().any(|allowed| allowed == id))
}

/* ============================= SERVICE ============================= */

#[derive(Clone)]
pub struct LogService {
    gateway: Gateway,
    apps: Arc<dyn AppsService>,
}

impl LogService {
    pub fn new(gateway: Gateway, apps: Arc<dyn AppsService>) -> Self {
        Self { gateway, apps }
    }

    /// List an analysis's pods, ownership-checked, projected to names.
    pub async fn list_pods(&self, analysis_id: &str, user: &str) -> Result<PodListing> {
        let pods = self.authorized_pods(analysis_id, user).await?;
        Ok(PodListing {
            pods: pods
                .into_iter()
                .map(|p| PodName { name: p.name_any() })
                .collect(),
        })
    }

    /// One-shot log read: the whole stream, split into lines.
    pub async fn collect_logs(
        &self,
        analysis_id: &str,
        user: &str,
        opts: &LogOpts,
    ) -> Result<LogPayload> {
        let since_time = Utc::now().timestamp();
        let pod = self.target_pod(analysis_id, user, opts).await?;
        let params = opts.to_log_params(since_time);

        let text = self.gateway.pod_logs(&pod.name_any(), &params).await?;

        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }

        Ok(LogPayload { since_time, lines })
    }

    /// Follow-mode log read: raw chunks until either side closes.
    pub async fn stream_logs(
        &self,
        analysis_id: &str,
        user: &str,
        opts: &LogOpts,
    ) -> Result<Body> {
        let now = Utc::now().timestamp();
        let pod = self.target_pod(analysis_id, user, opts).await?;
        let params = opts.to_log_params(now);

        let stream = self
            .gateway
            .pod_log_stream(&pod.name_any(), &params)
            .await?;
        Ok(Body::from_stream(ReaderStream::new(stream)))
    }

    /// Resolve the pod a log request targets, enforcing ownership.
    async fn target_pod(&self, analysis_id: &str, user: &str, opts: &LogOpts) -> Result<Pod> {
        let pods = self.authorized_pods(analysis_id, user).await?;

        match &opts.pod {
            Some(wanted) => pods
                .into_iter()
                .find(|p| p.name_any() == *wanted)
                .ok_or_else(|| {
                    ExposerError::unauthorised(format!(
                        "pod {wanted} does not belong to analysis {analysis_id}"
                    ))
                }),
            None => pods
                .into_iter()
                .min_by_key(|p| p.metadata.creation_timestamp.clone().map(|t| t.0))
                .ok_or_else(|| {
                    ExposerError::not_found(format!("no pods found for analysis {analysis_id}"))
                }),
        }
    }

    /// The pods of every external id the user may act on.
    async fn authorized_pods(&self, analysis_id: &str, user: &str) -> Result<Vec<Pod>> {
        let ids = authorized_external_ids(self.apps.as_ref(), user, analysis_id).await?;

        let mut pods = Vec::new();
        for id in &ids {
            let selector = labels::external_id_selector(id);
            pods.extend(list_by(&self.gateway.pods(), &selector).await?);
        }

        // The selector already scopes by external-id; the explicit check
        // stays as the authorisation invariant.
        pods.retain(|p| pod_owned_by(p, &ids));
        Ok(pods)
    }

    /// Fetch a single pod by name without an ownership check, for the
    /// admin surface.
    pub async fn get_pod(&self, name: &str) -> Result<Pod> {
        self.gateway
            .pods()
            .get(name)
            .await
            .map_err(|e| classify_kube("get", format!("pod/{name}"), e))
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with_external_id(name: &str, external_id: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "external-id".to_string(),
                    external_id.to_string(),
                )])),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    // ── ownership ──

    #[test]
    fn test_pod_owned_when_id_matches() {
        let pod = pod_with_external_id("p", "abc123");
        assert!(pod_owned_by(&pod, &["abc123".to_string()]));
    }

    #[test]
    fn test_pod_not_owned_when_id_differs() {
        let pod = pod_with_external_id("p", "zzz999");
        assert!(!pod_owned_by(&pod, &["abc123".to_string()]));
    }

    #[test]
    fn test_unlabeled_pod_never_owned() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                ..Default::default()
            },
            spec: None,
            status: None,
        };
        assert!(!pod_owned_by(&pod, &["abc123".to_string()]));
    }

    // ── option mapping ──

    #[test]
    fn test_log_params_defaults() {
        let params = LogOpts::default().to_log_params(1_000_000);
        assert_eq!(params.container.as_deref(), Some("analysis"));
        assert!(!params.follow);
        assert!(!params.previous);
        assert!(params.since_seconds.is_none());
        assert!(params.tail_lines.is_none());
        assert!(!params.timestamps);
    }

    #[test]
    fn test_log_params_explicit_options() {
        let opts = LogOpts {
            previous: Some(true),
            tail_lines: Some(50),
            timestamps: Some(true),
            follow: Some(true),
            container: Some("vice-proxy".to_string()),
            ..Default::default()
        };
        let params = opts.to_log_params(1_000_000);
        assert_eq!(params.container.as_deref(), Some("vice-proxy"));
        assert!(params.follow);
        assert!(params.previous);
        assert_eq!(params.tail_lines, Some(50));
        assert!(params.timestamps);
    }

    #[test]
    fn test_since_time_becomes_relative_window() {
        let opts = LogOpts {
            since_time: Some(999_940),
            ..Default::default()
        };
        let params = opts.to_log_params(1_000_000);
        assert_eq!(params.since_seconds, Some(60));
    }

    #[test]
    fn test_future_since_time_clamps_to_zero() {
        let opts = LogOpts {
            since_time: Some(1_000_100),
            ..Default::default()
        };
        let params = opts.to_log_params(1_000_000);
        assert_eq!(params.since_seconds, Some(0));
    }

    #[test]
    fn test_since_wins_over_since_time() {
        let opts = LogOpts {
            since: Some(120),
            since_time: Some(999_940),
            ..Default::default()
        };
        let params = opts.to_log_params(1_000_000);
        assert_eq!(params.since_seconds, Some(120));
    }

    #[test]
    fn test_query_field_names_use_dashes() {
        let opts: LogOpts = serde_json::from_value(serde_json::json!({
            "previous": true,
            "since-time": 123,
            "tail-lines": 10,
            "timestamps": false,
            "follow": true,
            "container": "analysis"
        }))
        .unwrap();
        assert_eq!(opts.previous, Some(true));
        assert_eq!(opts.since_time, Some(123));
        assert_eq!(opts.tail_lines, Some(10));
        assert_eq!(opts.timestamps, Some(false));
        assert_eq!(opts.follow, Some(true));
    }
}
