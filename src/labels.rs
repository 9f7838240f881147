use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::job::Job;

/* ============================= LABEL KEYS ============================= */

pub const EXTERNAL_ID: &str = "external-id";
pub const APP_TYPE: &str = "app-type";
pub const APP_ID: &str = "app-id";
pub const APP_NAME: &str = "app-name";
pub const ANALYSIS_NAME: &str = "analysis-name";
pub const USER_ID: &str = "user-id";
pub const USERNAME: &str = "username";
pub const TIME_LIMIT: &str = "timelimit-epoch-seconds";

/// Marks every object owned by this service.
pub const INTERACTIVE: &str = "interactive";

/// DNS label length limit; `analysis-name` is truncated to fit.
const MAX_LABEL_CHARS: usize = 62;

/* ============================= LABEL SET ============================= */

/// The canonical label set carried by every object belonging to an analysis.
///
/// `external-id` is the primary key; all lookups go through label selectors
/// built from these keys, never through object names alone.
pub fn label_set(job: &Job) -> BTreeMap<String, String> {
    BTreeMap::from([
        (EXTERNAL_ID.to_string(), job.invocation_id.clone()),
        (APP_TYPE.to_string(), INTERACTIVE.to_string()),
        (APP_ID.to_string(), job.app_id.clone()),
        (APP_NAME.to_string(), label_value_safe(&job.app_name)),
        (ANALYSIS_NAME.to_string(), label_value_safe(&job.name)),
        (USER_ID.to_string(), job.user_id.clone()),
        (USERNAME.to_string(), job.submitter.clone()),
    ])
}

/// Selector matching everything this service owns.
pub fn interactive_selector() -> String {
    format!("{APP_TYPE}={INTERACTIVE}")
}

/// Selector matching every object of one analysis.
pub fn external_id_selector(external_id: &str) -> String {
    format!("{APP_TYPE}={INTERACTIVE},{EXTERNAL_ID}={external_id}")
}

/// Build a selector string from an arbitrary filter map, with
/// `app-type=interactive` always forced in.
pub fn filter_selector(filter: &BTreeMap<String, String>) -> String {
    let mut pairs: Vec<String> = filter
        .iter()
        .filter(|(k, _)| k.as_str() != APP_TYPE)
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    pairs.insert(0, interactive_selector());
    pairs.join(",")
}

/* ============================= VALUE RULES ============================= */

/// Truncate to the first 62 characters. Character-based slicing: the limit
/// exists for DNS labels and a byte slice could split a multi-byte rune.
pub fn truncate_chars(name: &str) -> String {
    name.chars().take(MAX_LABEL_CHARS).collect()
}

/// Label values may not contain spaces or exceed the DNS label length.
fn label_value_safe(value: &str) -> String {
    truncate_chars(&value.replace(' ', "-"))
}

/* ============================= SUBDOMAIN ============================= */

/// Deterministic public host for an analysis.
///
/// Must match what the upstream analysis service computes; the hash is the
/// join key for reverse lookups from a request host back to an analysis.
pub fn subdomain(user_id: &str, invocation_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(invocation_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("a{}", &digest[..9])
}

/// Public URL the frontend reaches the analysis under.
pub fn frontend_url(base: &str, user_id: &str, invocation_id: &str) -> String {
    let host = subdomain(user_id, invocation_id);
    match base.split_once("://") {
        Some((scheme, rest)) => format!("{scheme}://{host}.{}", rest.trim_end_matches('/')),
        None => format!("{host}.{}", base.trim_end_matches('/')),
    }
}

/* ============================= TESTS ============================= */
