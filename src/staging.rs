use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::error::{ExposerError, Result, classify_http};
use crate::gateway::{Gateway, list_by};
use crate::labels;
use crate::resources::FILE_TRANSFER_PORT;

/// How often the side-car's status endpoint is polled.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on a single transfer before the coordinator gives up on it.
const TRANSFER_DEADLINE: Duration = Duration::from_secs(30 * 60);

/* ============================= DIRECTION ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    /// Path segment on the side-car.
    pub fn base_path(&self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

/* ============================= IN-FLIGHT MAP ============================= */

/// Process-wide record of transfers currently in flight.
///
/// A claim is held until its token drops, so the conflict window covers the
/// whole transfer, not just the initial POST.
#[derive(Clone, Default)]
pub struct InflightMap {
    inner: Arc<RwLock<HashSet<(String, Direction)>>>,
}

#[derive(Debug)]
pub struct InflightToken {
    map: Arc<RwLock<HashSet<(String, Direction)>>>,
    key: (String, Direction),
}

impl InflightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim (invocation, direction), failing with Conflict if another
    /// transfer in that direction is still running.
    pub fn try_claim(&self, invocation_id: &str, direction: Direction) -> Result<InflightToken> {
        let key = (invocation_id.to_string(), direction);
        let mut held = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(key.clone()) {
            return Err(ExposerError::conflict(format!(
                "a {} is already in flight for {invocation_id}",
                direction.base_path()
            )));
        }
        Ok(InflightToken {
            map: self.inner.clone(),
            key,
        })
    }

    pub fn is_in_flight(&self, invocation_id: &str, direction: Direction) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&(invocation_id.to_string(), direction))
    }
}

impl Drop for InflightToken {
    fn drop(&mut self) {
        let mut held = self
            .map
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
    }
}

/* ============================= POD RESOLUTION ============================= */

/// True when the pod is running and every container reports ready.
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .container_statuses
        .as_ref()
        .is_some_and(|statuses| !statuses.is_empty() && statuses.iter().all(|cs| cs.ready))
}

/// Choose the transfer target among the pods of one analysis: ready pods
/// only, oldest creation timestamp wins.
pub fn pick_ready_pod(pods: Vec<Pod>) -> Option<Pod> {
    pods.into_iter()
        .filter(is_pod_ready)
        .min_by_key(|p| p.metadata.creation_timestamp.clone().map(|t| t.0))
}

/* ============================= WIRE MODELS ============================= */

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    invocation_id: &'a str,
    user: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransferStatus {
    #[serde(default)]
    status: String,
}

/* ============================= COORDINATOR ============================= */

/// Drives the in-pod transfer side-car through its download/upload
/// protocol.
#[derive(Clone)]
pub struct Coordinator {
    gateway: Gateway,
    http: reqwest::Client,
    inflight: InflightMap,
}

impl Coordinator {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            inflight: InflightMap::new(),
        }
    }

    pub fn inflight(&self) -> &InflightMap {
        &self.inflight
    }

    /// Start (and in blocking mode, finish) a transfer for one analysis.
    ///
    /// Non-blocking calls return once the side-car accepts the request; a
    /// background task keeps the in-flight claim until the side-car reports
    /// a terminal status.
    pub async fn transfer(
        &self,
        invocation_id: &str,
        direction: Direction,
        blocking: bool,
    ) -> Result<()> {
        let token = self.inflight.try_claim(invocation_id, direction)?;

        let pod = self.resolve_pod(invocation_id).await?;
        let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone()).ok_or_else(|| {
            ExposerError::transient(
                "transfer",
                format!("external-id={invocation_id}"),
                "ready pod has no IP yet",
            )
        })?;
        let user = pod.labels().get(labels::USERNAME).cloned().unwrap_or_default();

        self.post_transfer(&pod_ip, invocation_id, &user, direction)
            .await?;
        info!(
            invocation_id = %invocation_id,
            direction = direction.base_path(),
            blocking,
            "transfer_accepted"
        );

        if blocking {
            // Token dropped on return, releasing the claim either way.
            let _token = token;
            self.poll_until_done(&pod_ip, invocation_id, direction).await
        } else {
            let this = self.clone();
            let id = invocation_id.to_string();
            let ip = pod_ip.clone();
            tokio::spawn(async move {
                // The claim lives exactly as long as the poll.
                let _token = token;
                if let Err(e) = this.poll_until_done(&ip, &id, direction).await {
                    warn!(invocation_id = %id, error = %e, "background_transfer_failed");
                }
            });
            Ok(())
        }
    }

    async fn resolve_pod(&self, invocation_id: &str) -> Result<Pod> {
        let selector = labels::external_id_selector(invocation_id);
        let pods = list_by(&self.gateway.pods(), &selector).await?;
        pick_ready_pod(pods).ok_or_else(|| {
            ExposerError::transient(
                "transfer",
                format!("external-id={invocation_id}"),
                "no ready pod for analysis",
            )
        })
    }

    async fn post_transfer(
        &self,
        pod_ip: &str,
        invocation_id: &str,
        user: &str,
        direction: Direction,
    ) -> Result<()> {
        let url = format!(
            "http://{pod_ip}:{FILE_TRANSFER_PORT}/{}",
            direction.base_path()
        );
        self.http
            .post(&url)
            .json(&TransferRequest {
                invocation_id,
                user,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| classify_http("transfer", format!("external-id={invocation_id}"), e))?;
        Ok(())
    }

    async fn poll_until_done(
        &self,
        pod_ip: &str,
        invocation_id: &str,
        direction: Direction,
    ) -> Result<()> {
        let url = format!("http://{pod_ip}:{FILE_TRANSFER_PORT}/status");
        let started = Instant::now();

        loop {
            if started.elapsed() > TRANSFER_DEADLINE {
                return Err(ExposerError::transient(
                    "transfer-status",
                    format!("external-id={invocation_id}"),
                    format!("{} did not finish in time", direction.base_path()),
                ));
            }
            sleep(POLL_INTERVAL).await;

            let status: TransferStatus = self
                .http
                .get(&url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| {
                    classify_http("transfer-status", format!("external-id={invocation_id}"), e)
                })?
                .json()
                .await
                .map_err(|e| {
                    classify_http("transfer-status", format!("external-id={invocation_id}"), e)
                })?;

            match status.status.as_str() {
                "completed" => return Ok(()),
                "failed" => {
                    return Err(ExposerError::transient(
                        "transfer-status",
                        format!("external-id={invocation_id}"),
                        format!("side-car reported a failed {}", direction.base_path()),
                    ));
                }
                _ => continue,
            }
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use k8s_openapi::chrono::{TimeZone, Utc};

    // ── in-flight map ──

    #[test]
    fn test_claim_then_conflict() {
        let map = InflightMap::new();
        let _token = map.try_claim("abc123", Direction::Upload).unwrap();
        let err = map.try_claim("abc123", Direction::Upload).unwrap_err();
        assert!(matches!(err, ExposerError::Conflict(_)));
    }

    #[test]
    fn test_directions_do_not_conflict() {
        let map = InflightMap::new();
        let _up = map.try_claim("abc123", Direction::Upload).unwrap();
        assert!(map.try_claim("abc123", Direction::Download).is_ok());
    }

    #[test]
    fn test_analyses_do_not_conflict() {
        let map = InflightMap::new();
        let _a = map.try_claim("abc123", Direction::Upload).unwrap();
        assert!(map.try_claim("def456", Direction::Upload).is_ok());
    }

    #[test]
    fn test_drop_releases_claim() {
        let map = InflightMap::new();
        {
            let _token = map.try_claim("abc123", Direction::Download).unwrap();
            assert!(map.is_in_flight("abc123", Direction::Download));
        }
        assert!(!map.is_in_flight("abc123", Direction::Download));
        assert!(map.try_claim("abc123", Direction::Download).is_ok());
    }

    // ── pod selection ──

    fn pod(name: &str, phase: &str, ready: bool, created_secs: i64) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap())),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some("10.0.0.1".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "analysis".to_string(),
                    ready,
                    restart_count: 0,
                    image: String::new(),
                    image_id: String::new(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_ready_pod_detected() {
        assert!(is_pod_ready(&pod("p", "Running", true, 0)));
    }

    #[test]
    fn test_pending_pod_not_ready() {
        assert!(!is_pod_ready(&pod("p", "Pending", true, 0)));
    }

    #[test]
    fn test_unready_container_not_ready() {
        assert!(!is_pod_ready(&pod("p", "Running", false, 0)));
    }

    #[test]
    fn test_pod_without_status_not_ready() {
        let bare = Pod {
            metadata: ObjectMeta::default(),
            spec: None,
            status: None,
        };
        assert!(!is_pod_ready(&bare));
    }

    #[test]
    fn test_oldest_ready_pod_wins() {
        let pods = vec![
            pod("young", "Running", true, 2000),
            pod("old", "Running", true, 1000),
            pod("older-but-unready", "Running", false, 500),
        ];
        let chosen = pick_ready_pod(pods).unwrap();
        assert_eq!(chosen.metadata.name.as_deref(), Some("old"));
    }

    #[test]
    fn test_no_ready_pod_yields_none() {
        let pods = vec![pod("a", "Pending", false, 0)];
        assert!(pick_ready_pod(pods).is_none());
    }

    // ── wire model ──

    #[test]
    fn test_transfer_status_parses() {
        let status: TransferStatus =
            serde_json::from_str(r#"{"status": "completed", "checksum": "xyz"}"#).unwrap();
        assert_eq!(status.status, "completed");
    }

    #[test]
    fn test_transfer_request_serialises() {
        let body = serde_json::to_value(TransferRequest {
            invocation_id: "abc123",
            user: "ipcdev",
        })
        .unwrap();
        assert_eq!(body["invocation_id"], "abc123");
        assert_eq!(body["user"], "ipcdev");
    }
}
