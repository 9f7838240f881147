use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::Settings;
use crate::job::Job;
use crate::labels;

use super::{
    EXCLUDES_FILE_NAME, INPUT_PATH_LIST_FILE_NAME, TICKET_PATH_LIST_FILE_NAME,
    excludes_configmap_name, input_path_list_configmap_name,
};

/* ============================= EXCLUDES ============================= */

/// Config map holding the newline-joined list of files the upload skips.
pub fn excludes_configmap(job: &Job) -> ConfigMap {
    let mut body = job.excluded_files().join("\n");
    if !body.is_empty() {
        body.push('\n');
    }

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(excludes_configmap_name(&job.invocation_id)),
            labels: Some(labels::label_set(job)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(EXCLUDES_FILE_NAME.to_string(), body)])),
        ..Default::default()
    }
}

/* ============================= INPUT PATH LISTS ============================= */

/// Config map holding the path-list file(s) consumed by the transfer
/// containers. Absent when the job has no without-ticket inputs.
///
/// With-ticket inputs ride along in a second key, one `ticket,path` line
/// each under their own header.
pub fn input_path_list_configmap(job: &Job, settings: &Settings) -> Option<ConfigMap> {
    let plain = job.inputs_without_tickets();
    if plain.is_empty() {
        return None;
    }

    let mut data = BTreeMap::new();
    data.insert(
        INPUT_PATH_LIST_FILE_NAME.to_string(),
        path_list_file(
            &settings.input_path_list_identifier,
            plain.iter().map(|i| i.value.clone()),
        ),
    );

    let ticketed = job.inputs_with_tickets();
    if !ticketed.is_empty() {
        data.insert(
            TICKET_PATH_LIST_FILE_NAME.to_string(),
            path_list_file(
                &settings.ticket_input_path_list_identifier,
                ticketed.iter().map(|i| format!("{},{}", i.ticket, i.value)),
            ),
        );
    }

    Some(ConfigMap {
        metadata: ObjectMeta {
            name: Some(input_path_list_configmap_name(&job.invocation_id)),
            labels: Some(labels::label_set(job)),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

fn path_list_file(header: &str, lines: impl Iterator<Item = String>) -> String {
    let mut body = header.to_string();
    for line in lines {
        body.push('\n');
        body.push_str(&line);
    }
    body.push('\n');
    body
}

/* ============================= TESTS ============================= */
