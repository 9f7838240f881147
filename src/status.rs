use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::watcher::{Config, Event, watcher};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Result, classify_http};
use crate::gateway::Gateway;
use crate::http::{STATUS_EVENTS_TOTAL, WATCH_RESTARTS_TOTAL};
use crate::labels;

/* ============================= BACK-OFF ============================= */

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Retry budget per notification; delivery is at-least-once overall, so
/// giving up on one event is acceptable.
const MAX_SEND_ATTEMPTS: u32 = 8;

/// Exponential back-off schedule: 500 ms doubling up to a 30 s cap.
pub fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE
        .checked_mul(2u32.saturating_pow(attempt))
        .map_or(BACKOFF_CAP, |d| d.min(BACKOFF_CAP))
}

/* ============================= NOTIFICATIONS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Running => "Running",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
        }
    }
}

/// Body POSTed to the external status sink.
#[derive(Debug, Clone, Serialize)]
pub struct StatusMessage {
    pub host: String,
    pub state: JobState,
    pub message: String,
}

/// A status-sink update derived from one pod event.
#[derive(Debug, Clone)]
pub struct Notification {
    pub external_id: String,
    pub body: StatusMessage,
}

fn notification(pod: &Pod, state: JobState, message: String) -> Option<Notification> {
    let pod_labels = pod.labels();
    let external_id = pod_labels.get(labels::EXTERNAL_ID)?.clone();
    let user_id = pod_labels.get(labels::USER_ID)?;

    Some(Notification {
        body: StatusMessage {
            host: labels::subdomain(user_id, &external_id),
            state,
            message,
        },
        external_id,
    })
}

/// A pod appeared for an analysis.
pub fn added_notification(pod: &Pod) -> Option<Notification> {
    let analysis_name = pod
        .labels()
        .get(labels::ANALYSIS_NAME)
        .cloned()
        .unwrap_or_default();
    notification(
        pod,
        JobState::Running,
        format!(
            "pod {} started for analysis {analysis_name}",
            pod.name_any()
        ),
    )
}

/// Container states that indicate the analysis has crashed rather than
/// merely restarted or progressed.
const CRASH_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "ContainerCannotRun",
    "OOMKilled",
    "Error",
];

/// A pod changed: failure if any container terminated non-zero or sits in
/// a crash state, otherwise a running re-assertion.
pub fn modified_notification(pod: &Pod) -> Option<Notification> {
    if let Some(reason) = failure_reason(pod) {
        return notification(pod, JobState::Failed, reason);
    }
    notification(
        pod,
        JobState::Running,
        format!("pod {} modified", pod.name_any()),
    )
}

pub fn deleted_notification(pod: &Pod) -> Option<Notification> {
    notification(
        pod,
        JobState::Succeeded,
        format!("pod {} deleted", pod.name_any()),
    )
}

fn failure_reason(pod: &Pod) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;

    for cs in statuses {
        if let Some(state) = &cs.state {
            if let Some(terminated) = &state.terminated
                && terminated.exit_code != 0
            {
                let reason = terminated.reason.as_deref().unwrap_or("terminated");
                return Some(format!(
                    "container {} {} with exit code {}",
                    cs.name, reason, terminated.exit_code
                ));
            }
            if let Some(waiting) = &state.waiting
                && let Some(reason) = waiting.reason.as_deref()
                && CRASH_REASONS.contains(&reason)
            {
                return Some(format!("container {} is in state {reason}", cs.name));
            }
        }
    }
    None
}

/* ============================= SINK ============================= */

/// Where job-state notifications go. Injected so tests can observe
/// deliveries without a listener.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn post(&self, external_id: &str, body: &StatusMessage) -> Result<()>;
}

pub struct HttpStatusSink {
    http: reqwest::Client,
    base_url: String,
}

impl HttpStatusSink {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StatusSink for HttpStatusSink {
    async fn post(&self, external_id: &str, body: &StatusMessage) -> Result<()> {
        let url = format!("{}/{external_id}/status", self.base_url);
        self.http
            .post(&url)
            .json(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| classify_http("status-post", format!("external-id={external_id}"), e))?;
        Ok(())
    }
}

/// Deliver one notification, retrying transient failures with back-off.
/// 4xx responses are terminal: the event is dropped after a warning.
async fn send_with_retry(sink: &dyn StatusSink, note: &Notification) {
    for attempt in 0..MAX_SEND_ATTEMPTS {
        match sink.post(&note.external_id, &note.body).await {
            Ok(()) => {
                STATUS_EVENTS_TOTAL
                    .with_label_values(&[note.body.state.as_str()])
                    .inc();
                return;
            }
            Err(e) if e.is_transient() && attempt + 1 < MAX_SEND_ATTEMPTS => {
                debug!(
                    external_id = %note.external_id,
                    attempt,
                    error = %e,
                    "status_post_retrying"
                );
                sleep(backoff_delay(attempt)).await;
            }
            Err(e) => {
                warn!(
                    external_id = %note.external_id,
                    error = %e,
                    "status_post_dropped"
                );
                return;
            }
        }
    }
}

/* ============================= BRIDGE ============================= */

/// Translates cluster events on interactive-app objects into external
/// job-state notifications.
///
/// One task per watched kind; each restarts its watch when the stream
/// ends. Resource-version continuity is not required: the cluster stays
/// the source of truth and later events re-assert status.
pub struct StatusBridge {
    gateway: Gateway,
    sink: Arc<dyn StatusSink>,
}

impl StatusBridge {
    pub fn new(gateway: Gateway, sink: Arc<dyn StatusSink>) -> Self {
        Self { gateway, sink }
    }

    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(pod_watch_loop(
                self.gateway.pods(),
                self.sink.clone(),
                shutdown.subscribe(),
            )),
            tokio::spawn(logged_watch_loop::<Deployment>(
                self.gateway.deployments(),
                shutdown.subscribe(),
            )),
            tokio::spawn(logged_watch_loop::<Service>(
                self.gateway.services(),
                shutdown.subscribe(),
            )),
            tokio::spawn(logged_watch_loop::<Ingress>(
                self.gateway.ingresses(),
                shutdown.subscribe(),
            )),
        ]
    }
}

async fn pod_watch_loop(
    api: Api<Pod>,
    sink: Arc<dyn StatusSink>,
    mut shutdown: broadcast::Receiver<()>,
) {
    // Pods already observed, so re-applies can be told apart from
    // first sightings.
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        let config = Config::default().labels(&labels::interactive_selector());
        let mut stream = watcher(api.clone(), config).boxed();
        info!("pod_watch_started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("pod_watch_stopped");
                    return;
                }
                event = stream.next() => {
                    match event {
                        Some(Ok(ev)) => handle_pod_event(ev, &mut seen, sink.as_ref()).await,
                        Some(Err(e)) => warn!(error = %e, "pod_watch_error"),
                        None => break,
                    }
                }
            }
        }

        WATCH_RESTARTS_TOTAL.inc();
        info!("pod_watch_restarting");
        sleep(Duration::from_secs(1)).await;
    }
}

async fn handle_pod_event(event: Event<Pod>, seen: &mut HashSet<String>, sink: &dyn StatusSink) {
    match event {
        Event::Applied(pod) => {
            let name = pod.name_any();
            let note = if seen.insert(name) {
                added_notification(&pod)
            } else {
                modified_notification(&pod)
            };
            if let Some(note) = note {
                send_with_retry(sink, &note).await;
            }
        }
        Event::Deleted(pod) => {
            seen.remove(&pod.name_any());
            if let Some(note) = deleted_notification(&pod) {
                send_with_retry(sink, &note).await;
            }
        }
        Event::Restarted(pods) => {
            // Fresh listing after a watch (re)start: re-assert Running for
            // everything present.
            seen.clear();
            for pod in pods {
                seen.insert(pod.name_any());
                if let Some(note) = added_notification(&pod) {
                    send_with_retry(sink, &note).await;
                }
            }
        }
    }
}

/// Deployment/service/ingress events inform readiness decisions but are
/// not forwarded to the sink.
async fn logged_watch_loop<K>(api: Api<K>, mut shutdown: broadcast::Receiver<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();

    loop {
        let config = Config::default().labels(&labels::interactive_selector());
        let mut stream = watcher(api.clone(), config).boxed();
        info!(kind = %kind, "watch_started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(kind = %kind, "watch_stopped");
                    return;
                }
                event = stream.next() => {
                    match event {
                        Some(Ok(Event::Applied(obj))) => {
                            debug!(kind = %kind, name = %obj.name_any(), "object_applied");
                        }
                        Some(Ok(Event::Deleted(obj))) => {
                            debug!(kind = %kind, name = %obj.name_any(), "object_deleted");
                        }
                        Some(Ok(Event::Restarted(objs))) => {
                            debug!(kind = %kind, count = objs.len(), "watch_resynced");
                        }
                        Some(Err(e)) => warn!(kind = %kind, error = %e, "watch_error"),
                        None => break,
                    }
                }
            }
        }

        WATCH_RESTARTS_TOTAL.inc();
        info!(kind = %kind, "watch_restarting");
        sleep(Duration::from_secs(1)).await;
    }
}

/* ============================= TESTS ============================= */
