use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{ExposerError, Result};

/// Execution target value that marks a job as an interactive analysis.
pub const INTERAPPS_TARGET: &str = "interapps";

/* ============================= MODEL ============================= */

/// An analysis submission as received on `POST /vice/launch`.
///
/// The model is deliberately tolerant: anything beyond what the exposer
/// consumes is ignored, and container-level fields default so partially
/// specified submissions still deserialize (validation happens in
/// [`Job::validate`], not in serde).
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub invocation_id: String,
    pub user_id: String,
    /// Short username of the submitting user (no domain suffix).
    pub submitter: String,
    pub app_id: String,
    pub app_name: String,
    /// Analysis name chosen by the user; only its first 62 characters end
    /// up in labels.
    pub name: String,
    pub execution_target: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Destination folder for output uploads.
    #[serde(default)]
    pub output_dir: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Step {
    pub component: Component,
    #[serde(default)]
    pub config: StepConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Component {
    pub container: ContainerSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerSpec {
    pub image: Image,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub max_cpu_cores: Option<f64>,
    /// Memory limit in bytes.
    #[serde(default)]
    pub memory_limit: Option<i64>,
    #[serde(default)]
    pub ports: Vec<ContainerPortSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Image {
    pub name: String,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerPortSpec {
    pub container_port: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub input: Vec<StepInput>,
    #[serde(default)]
    pub output: Vec<StepOutput>,
    #[serde(default)]
    pub parameters: Vec<StepParam>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepInput {
    /// File or folder name as it lands in the working directory.
    #[serde(default)]
    pub name: String,
    /// Source path in the data store.
    #[serde(default)]
    pub value: String,
    /// Access ticket; non-empty marks a with-ticket input.
    #[serde(default)]
    pub ticket: String,
    /// Retained inputs are uploaded back alongside outputs.
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepOutput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepParam {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub order: i32,
}

/* ============================= ACCESSORS ============================= */

impl Job {
    /// Reject anything that is not a well-formed interactive submission.
    pub fn validate(&self) -> Result<()> {
        if self.execution_target != INTERAPPS_TARGET {
            return Err(ExposerError::invalid(format!(
                "execution_target must be \"{INTERAPPS_TARGET}\", got \"{}\"",
                self.execution_target
            )));
        }
        if self.invocation_id.is_empty() {
            return Err(ExposerError::invalid("invocation_id must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(ExposerError::invalid("job has no steps"));
        }
        Ok(())
    }

    /// The first step carries the container the analysis runs in.
    pub fn first_step(&self) -> Result<&Step> {
        self.steps
            .first()
            .ok_or_else(|| ExposerError::invalid("job has no steps"))
    }

    pub fn container(&self) -> Result<&ContainerSpec> {
        Ok(&self.first_step()?.component.container)
    }

    /// Declared container ports of the analysis, in submission order.
    pub fn analysis_ports(&self) -> Vec<i32> {
        self.steps
            .first()
            .map(|s| {
                s.component
                    .container
                    .ports
                    .iter()
                    .map(|p| p.container_port)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Inputs fetched without an access ticket.
    pub fn inputs_without_tickets(&self) -> Vec<&StepInput> {
        self.all_inputs()
            .into_iter()
            .filter(|i| i.ticket.is_empty())
            .collect()
    }

    /// Inputs that require an access ticket to fetch.
    pub fn inputs_with_tickets(&self) -> Vec<&StepInput> {
        self.all_inputs()
            .into_iter()
            .filter(|i| !i.ticket.is_empty())
            .collect()
    }

    fn all_inputs(&self) -> Vec<&StepInput> {
        self.steps
            .iter()
            .flat_map(|s| s.config.input.iter())
            .collect()
    }

    /// Names excluded from the output upload: downloaded inputs that were
    /// not marked for retention.
    pub fn excluded_files(&self) -> Vec<String> {
        self.steps
            .iter()
            .flat_map(|s| s.config.input.iter())
            .filter(|i| !i.retain && !i.name.is_empty())
            .map(|i| i.name.clone())
            .collect()
    }
}

impl Step {
    /// Flatten the step parameters into a command-line argument list.
    ///
    /// Parameters are ordered by their `order` field; empty names and
    /// values are skipped.
    pub fn arguments(&self) -> Vec<String> {
        let mut params: Vec<&StepParam> = self.config.parameters.iter().collect();
        params.sort_by_key(|p| p.order);

        let mut args = Vec::new();
        for p in params {
            if !p.name.is_empty() {
                args.push(p.name.clone());
            }
            if !p.value.is_empty() {
                args.push(p.value.clone());
            }
        }
        args
    }
}

impl ContainerSpec {
    pub fn image_ref(&self) -> String {
        if self.tag().is_empty() {
            self.image.name.clone()
        } else {
            format!("{}:{}", self.image.name, self.tag())
        }
    }

    fn tag(&self) -> &str {
        &self.image.tag
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_job_json() -> serde_json::Value {
        serde_json::json!({
            "invocation_id": "abc123",
            "user_id": "u1",
            "submitter": "ipcdev",
            "app_id": "app-1",
            "app_name": "jupyter",
            "name": "my analysis",
            "execution_target": "interapps",
            "output_dir": "/iplant/home/ipcdev/analyses/out",
            "steps": [{
                "component": {
                    "container": {
                        "image": {"name": "demo", "tag": "1.0"},
                        "uid": 1000,
                        "ports": [{"container_port": 8888}]
                    }
                }
            }]
        })
    }

    fn minimal_job() -> Job {
        serde_json::from_value(minimal_job_json()).unwrap()
    }

    // ── deserialization ──

    #[test]
    fn test_minimal_job_deserializes() {
        let job = minimal_job();
        assert_eq!(job.invocation_id, "abc123");
        assert_eq!(job.submitter, "ipcdev");
        assert_eq!(job.analysis_ports(), vec![8888]);
        assert!(job.environment.is_empty());
    }

    #[test]
    fn test_container_defaults() {
        let job = minimal_job();
        let c = job.container().unwrap();
        assert_eq!(c.uid, 1000);
        assert!(c.entrypoint.is_none());
        assert!(c.max_cpu_cores.is_none());
        assert!(c.memory_limit.is_none());
    }

    #[test]
    fn test_image_ref_with_and_without_tag() {
        let mut job = minimal_job();
        assert_eq!(job.container().unwrap().image_ref(), "demo:1.0");
        job.steps[0].component.container.image.tag = String::new();
        assert_eq!(job.container().unwrap().image_ref(), "demo");
    }

    // ── validation ──

    #[test]
    fn test_validate_accepts_interapps() {
        assert!(minimal_job().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_target() {
        let mut job = minimal_job();
        job.execution_target = "condor".to_string();
        let err = job.validate().unwrap_err();
        assert!(matches!(err, ExposerError::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_rejects_empty_steps() {
        let mut job = minimal_job();
        job.steps.clear();
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_invocation_id() {
        let mut job = minimal_job();
        job.invocation_id = String::new();
        assert!(job.validate().is_err());
    }

    // ── input classification ──

    fn job_with_inputs() -> Job {
        let mut v = minimal_job_json();
        v["steps"][0]["config"] = serde_json::json!({
            "input": [
                {"name": "genome.fa", "value": "/iplant/home/ipcdev/genome.fa"},
                {"name": "shared.csv", "value": "/iplant/home/other/shared.csv", "ticket": "t-42"},
                {"name": "keep.txt", "value": "/iplant/home/ipcdev/keep.txt", "retain": true}
            ],
            "output": [{"name": "results", "retain": true}]
        });
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_input_ticket_split() {
        let job = job_with_inputs();
        let without: Vec<_> = job
            .inputs_without_tickets()
            .iter()
            .map(|i| i.name.clone())
            .collect();
        let with: Vec<_> = job
            .inputs_with_tickets()
            .iter()
            .map(|i| i.name.clone())
            .collect();
        assert_eq!(without, vec!["genome.fa", "keep.txt"]);
        assert_eq!(with, vec!["shared.csv"]);
    }

    #[test]
    fn test_excluded_files_skips_retained() {
        let job = job_with_inputs();
        assert_eq!(job.excluded_files(), vec!["genome.fa", "shared.csv"]);
    }

    #[test]
    fn test_no_inputs_means_no_excludes() {
        assert!(minimal_job().excluded_files().is_empty());
    }

    // ── argument flattening ──

    #[test]
    fn test_arguments_ordered_and_flattened() {
        let mut v = minimal_job_json();
        v["steps"][0]["config"] = serde_json::json!({
            "parameters": [
                {"name": "--port", "value": "8888", "order": 2},
                {"name": "notebook", "order": 1},
                {"value": "--no-browser", "order": 3}
            ]
        });
        let job: Job = serde_json::from_value(v).unwrap();
        assert_eq!(
            job.steps[0].arguments(),
            vec!["notebook", "--port", "8888", "--no-browser"]
        );
    }

    #[test]
    fn test_arguments_empty_config() {
        assert!(minimal_job().steps[0].arguments().is_empty());
    }
}
