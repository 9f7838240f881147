use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/* ============================= SETTINGS ============================= */

/// Operator-provided configuration, loaded once at startup from a YAML file.
///
/// Everything the resource builders and the external collaborators need is
/// carried here so the builders stay pure functions of `(job, settings)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Namespace this service itself operates in.
    pub namespace: String,

    /// Namespace the analysis workloads run in. Defaults to `namespace`.
    #[serde(default)]
    pub vice_namespace: Option<String>,

    /// Image used by the file-transfer init container and side-car.
    pub porklock_image: String,
    #[serde(default = "default_porklock_tag")]
    pub porklock_tag: String,

    /// Image for the authenticating proxy container.
    pub vice_proxy_image: String,

    pub cas_base_url: String,
    pub frontend_base_url: String,

    /// Backend used for ingresses created through the generic CRUD surface.
    #[serde(default = "default_backend_service")]
    pub vice_default_backend_service: String,
    #[serde(default = "default_backend_port")]
    pub vice_default_backend_service_port: i32,

    /// Resolves a subdomain host to an analysis id.
    pub get_analysis_id_service: String,

    /// Checks a user's access to an analysis for host-based lookups.
    pub check_resource_access_service: String,

    #[serde(default)]
    pub vice_backend_namespace: Option<String>,

    pub apps_service_base_url: String,

    /// Base URL for the external job-status sink.
    pub job_status_url: String,

    /// Appended to bare usernames before calling the metadata services.
    #[serde(default)]
    pub user_suffix: String,

    /// Header line identifying a plain input path-list file.
    #[serde(default = "default_path_list_identifier")]
    pub input_path_list_identifier: String,

    /// Header line identifying a ticket-bearing path-list file.
    #[serde(default = "default_ticket_list_identifier")]
    pub ticket_input_path_list_identifier: String,

    #[serde(default)]
    pub image_pull_secret_name: Option<String>,

    /// When set, the shared transfer volume is backed by a CSI ephemeral
    /// volume instead of an emptyDir.
    #[serde(default)]
    pub use_csi_driver: bool,
    #[serde(default = "default_csi_driver")]
    pub csi_driver_name: String,

    pub permissions_url: String,

    pub keycloak_base_url: String,
    pub keycloak_realm: String,
    pub keycloak_client_id: String,
    pub keycloak_client_secret: String,

    /// Node placement for the interactive-apps pool.
    #[serde(default = "default_node_label")]
    pub node_selector_key: String,
    #[serde(default = "default_node_value")]
    pub node_selector_value: String,
    #[serde(default = "default_node_label")]
    pub toleration_key: String,
    #[serde(default = "default_node_value")]
    pub toleration_value: String,
    #[serde(default = "default_toleration_effect")]
    pub toleration_effect: String,

    /// Seconds granted to a fresh launch before the sweeper may end it.
    #[serde(default = "default_time_limit")]
    pub default_time_limit_seconds: i64,
}

fn default_porklock_tag() -> String {
    "latest".to_string()
}

fn default_backend_service() -> String {
    "vice-default-backend".to_string()
}

fn default_backend_port() -> i32 {
    80
}

fn default_path_list_identifier() -> String {
    "# application/vnd.de.path-list+csv; version=1".to_string()
}

fn default_ticket_list_identifier() -> String {
    "# application/vnd.de.tickets-path-list+csv; version=1".to_string()
}

fn default_csi_driver() -> String {
    "irods.csi.cyverse.org".to_string()
}

fn default_node_label() -> String {
    "vice".to_string()
}

fn default_node_value() -> String {
    "true".to_string()
}

fn default_toleration_effect() -> String {
    "NoSchedule".to_string()
}

fn default_time_limit() -> i64 {
    72 * 60 * 60
}

impl Settings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(settings)
    }

    /// Namespace analysis workloads live in.
    pub fn vice_namespace(&self) -> &str {
        self.vice_namespace.as_deref().unwrap_or(&self.namespace)
    }

    pub fn porklock_image_ref(&self) -> String {
        format!("{}:{}", self.porklock_image, self.porklock_tag)
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
namespace: de
porklock_image: discoenv/porklock
vice_proxy_image: discoenv/vice-proxy
cas_base_url: https://cas.example.org/cas
frontend_base_url: https://cyverse.run
get_analysis_id_service: http://get-analysis-id
check_resource_access_service: http://check-resource-access
apps_service_base_url: http://apps
job_status_url: http://job-status-listener/status
permissions_url: http://permissions
keycloak_base_url: https://keycloak.example.org
keycloak_realm: de
keycloak_client_id: vice
keycloak_client_secret: s3cr3t
"#;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let s: Settings = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(s.namespace, "de");
        assert_eq!(s.vice_namespace(), "de");
        assert_eq!(s.porklock_tag, "latest");
        assert_eq!(s.porklock_image_ref(), "discoenv/porklock:latest");
        assert!(!s.use_csi_driver);
        assert_eq!(s.default_time_limit_seconds, 259_200);
        assert_eq!(s.toleration_effect, "NoSchedule");
    }

    #[test]
    fn test_vice_namespace_override() {
        let raw = format!("{MINIMAL}vice_namespace: vice-apps\n");
        let s: Settings = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(s.vice_namespace(), "vice-apps");
        assert_eq!(s.namespace, "de");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = format!("{MINIMAL}no_such_option: true\n");
        let parsed: Result<Settings, _> = serde_yaml::from_str(&raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_path_list_identifiers_default() {
        let s: Settings = serde_yaml::from_str(MINIMAL).unwrap();
        assert!(s.input_path_list_identifier.contains("path-list"));
        assert!(s.ticket_input_path_list_identifier.contains("tickets"));
        assert_ne!(
            s.input_path_list_identifier,
            s.ticket_input_path_list_identifier
        );
    }
}
