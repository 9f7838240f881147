use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{ExposerError, Result, classify_http};

/// Ceiling for calls to the metadata/permissions services.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/* ============================= USERNAME RULES ============================= */

/// Append the configured user suffix unless it is already present.
///
/// The HTTP surface receives bare usernames; the metadata services expect
/// qualified ones. The transform happens here, at this boundary, exactly
/// once.
pub fn qualify_username(user: &str, suffix: &str) -> String {
    if suffix.is_empty() || user.ends_with(suffix) {
        user.to_string()
    } else {
        format!("{user}{suffix}")
    }
}

/* ============================= CAPABILITIES ============================= */

/// Resolves which external ids (invocation ids) belong to an analysis the
/// user can see.
#[async_trait]
pub trait AppsService: Send + Sync {
    async fn external_ids(&self, user: &str, analysis_id: &str) -> Result<Vec<String>>;
}

/// Answers whether a user holds any permission on an analysis.
#[async_trait]
pub trait Permissions: Send + Sync {
    async fn is_allowed(&self, user: &str, analysis_id: &str) -> Result<bool>;
}

/// Maps a public subdomain host back to the analysis id the upstream
/// service registered for it.
#[async_trait]
pub trait AnalysisResolver: Send + Sync {
    async fn analysis_id_for_host(&self, host: &str) -> Result<String>;
}

/// Authorise `user` for `analysis_id` and return the external ids they may
/// act on. Empty step lists mean the analysis is unknown to the user.
pub async fn authorized_external_ids(
    apps: &dyn AppsService,
    user: &str,
    analysis_id: &str,
) -> Result<Vec<String>> {
    let ids = apps.external_ids(user, analysis_id).await?;
    if ids.is_empty() {
        return Err(ExposerError::unauthorised(format!(
            "user {user} has no access to analysis {analysis_id}"
        )));
    }
    Ok(ids)
}

/* ============================= WIRE MODELS ============================= */

#[derive(Debug, Deserialize)]
struct StepListing {
    #[serde(default)]
    steps: Vec<StepEntry>,
}

#[derive(Debug, Deserialize)]
struct StepEntry {
    #[serde(default)]
    external_id: String,
}

#[derive(Debug, Deserialize)]
struct PermissionListing {
    #[serde(default)]
    permissions: Vec<PermissionEntry>,
}

#[derive(Debug, Deserialize)]
struct PermissionEntry {
    #[serde(default)]
    permission_level: String,
}

#[derive(Debug, Deserialize)]
struct HostLookup {
    id: String,
}

/* ============================= HTTP IMPLEMENTATIONS ============================= */

pub struct HttpAppsService {
    http: reqwest::Client,
    base_url: String,
    user_suffix: String,
}

impl HttpAppsService {
    pub fn new(base_url: impl Into<String>, user_suffix: impl Into<String>) -> Self {
        Self {
            http: http_client(),
            base_url: trimmed(base_url),
            user_suffix: user_suffix.into(),
        }
    }
}

#[async_trait]
impl AppsService for HttpAppsService {
    async fn external_ids(&self, user: &str, analysis_id: &str) -> Result<Vec<String>> {
        let user = qualify_username(user, &self.user_suffix);
        let url = format!("{}/analyses/{analysis_id}/steps", self.base_url);
        let listing: StepListing = self
            .http
            .get(&url)
            .query(&[("user", user.as_str())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| classify_http("apps-steps", format!("analysis/{analysis_id}"), e))?
            .json()
            .await
            .map_err(|e| classify_http("apps-steps", format!("analysis/{analysis_id}"), e))?;

        Ok(listing
            .steps
            .into_iter()
            .map(|s| s.external_id)
            .filter(|id| !id.is_empty())
            .collect())
    }
}

pub struct HttpPermissions {
    http: reqwest::Client,
    base_url: String,
    user_suffix: String,
}

impl HttpPermissions {
    pub fn new(base_url: impl Into<String>, user_suffix: impl Into<String>) -> Self {
        Self {
            http: http_client(),
            base_url: trimmed(base_url),
            user_suffix: user_suffix.into(),
        }
    }
}

#[async_trait]
impl Permissions for HttpPermissions {
    async fn is_allowed(&self, user: &str, analysis_id: &str) -> Result<bool> {
        let user = qualify_username(user, &self.user_suffix);
        let url = format!(
            "{}/permissions/subjects/user/{user}/analysis/{analysis_id}",
            self.base_url
        );
        let listing: PermissionListing = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| classify_http("permissions", format!("analysis/{analysis_id}"), e))?
            .json()
            .await
            .map_err(|e| classify_http("permissions", format!("analysis/{analysis_id}"), e))?;

        Ok(has_permission(&listing))
    }
}

pub struct HttpAnalysisResolver {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAnalysisResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: http_client(),
            base_url: trimmed(base_url),
        }
    }
}

#[async_trait]
impl AnalysisResolver for HttpAnalysisResolver {
    async fn analysis_id_for_host(&self, host: &str) -> Result<String> {
        let url = format!("{}/{host}", self.base_url);
        let lookup: HostLookup = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| classify_http("analysis-id", format!("host/{host}"), e))?
            .json()
            .await
            .map_err(|e| classify_http("analysis-id", format!("host/{host}"), e))?;
        Ok(lookup.id)
    }
}

fn has_permission(listing: &PermissionListing) -> bool {
    listing
        .permissions
        .iter()
        .any(|p| !p.permission_level.trim().is_empty())
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(CALL_TIMEOUT)
        .build()
        .unwrap_or_default()
}

fn trimmed(base: impl Into<String>) -> String {
    base.into().trim_end_matches('/').to_string()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    // ── username qualification ──

    #[test]
    fn test_suffix_appended_to_bare_username() {
        assert_eq!(
            qualify_username("ipcdev", "@iplantcollaborative.org"),
            "ipcdev@iplantcollaborative.org"
        );
    }

    #[test]
    fn test_suffix_not_doubled() {
        assert_eq!(
            qualify_username("ipcdev@iplantcollaborative.org", "@iplantcollaborative.org"),
            "ipcdev@iplantcollaborative.org"
        );
    }

    #[test]
    fn test_empty_suffix_is_identity() {
        assert_eq!(qualify_username("ipcdev", ""), "ipcdev");
    }

    // ── wire model parsing ──

    #[test]
    fn test_step_listing_flattens_external_ids() {
        let listing: StepListing = serde_json::from_value(serde_json::json!({
            "steps": [
                {"external_id": "abc123", "step_type": "Interactive"},
                {"external_id": "def456"}
            ]
        }))
        .unwrap();
        let ids: Vec<String> = listing.steps.into_iter().map(|s| s.external_id).collect();
        assert_eq!(ids, vec!["abc123", "def456"]);
    }

    #[test]
    fn test_empty_step_listing() {
        let listing: StepListing = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(listing.steps.is_empty());
    }

    #[test]
    fn test_permission_listing_truthy_on_level() {
        let listing: PermissionListing = serde_json::from_value(serde_json::json!({
            "permissions": [{"permission_level": "own"}]
        }))
        .unwrap();
        assert!(has_permission(&listing));
    }

    #[test]
    fn test_permission_listing_blank_level_is_denied() {
        let listing: PermissionListing = serde_json::from_value(serde_json::json!({
            "permissions": [{"permission_level": "  "}]
        }))
        .unwrap();
        assert!(!has_permission(&listing));
    }

    #[test]
    fn test_permission_listing_empty_is_denied() {
        let listing: PermissionListing =
            serde_json::from_value(serde_json::json!({"permissions": []})).unwrap();
        assert!(!has_permission(&listing));
    }

    // ── authorisation helper ──

    struct FakeApps(Vec<String>);

    #[async_trait]
    impl AppsService for FakeApps {
        async fn external_ids(&self, _user: &str, _analysis_id: &str) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_authorized_external_ids_passes_through() {
        let apps = FakeApps(vec!["abc123".to_string()]);
        let ids = authorized_external_ids(&apps, "ipcdev", "analysis-1")
            .await
            .unwrap();
        assert_eq!(ids, vec!["abc123"]);
    }

    #[tokio::test]
    async fn test_authorized_external_ids_empty_is_unauthorised() {
        let apps = FakeApps(Vec::new());
        let err = authorized_external_ids(&apps, "ipcdev", "analysis-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ExposerError::Unauthorised(_)));
    }
}
