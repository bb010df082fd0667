//! Per-worker command plans
//!
//! A [`LoadTestPlan`] describes what every worker runs once it is ready: setup
//! steps, uploads of the scenario and properties files, then the load-test
//! command itself. Files are embedded in the exec command as base64, so no
//! stdin stream is needed.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use error_stack::Report;

use super::types::{FleetError, RemoteCommand, Result, TestInfo};

/// Directory inside each worker that receives uploaded files
pub const REMOTE_WORKDIR: &str = "/tmp/podfleet";

pub const DEFAULT_JMETER_VERSION: &str = "5.6.3";

/// Load-test command used when none is configured
pub const DEFAULT_COMMAND_TEMPLATE: &str =
    "/opt/apache-jmeter-5.6.3/bin/jmeter -n -t {scenario} -q {properties} -l {results}";

/// A file handed to the fleet; contents are opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl TestFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Location of this file inside a worker.
    pub fn remote_path(&self) -> String {
        let base = Path::new(&self.name)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("file");
        format!("{REMOTE_WORKDIR}/{base}")
    }
}

/// Steps a single worker runs, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    pub info: TestInfo,
    pub steps: Vec<RemoteCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTestPlan {
    pub setup: Vec<RemoteCommand>,
    pub scenarios: Vec<TestFile>,
    pub properties: Vec<TestFile>,
    pub command_template: String,
}

impl Default for LoadTestPlan {
    fn default() -> Self {
        Self {
            setup: default_setup(),
            scenarios: Vec::new(),
            properties: Vec::new(),
            command_template: DEFAULT_COMMAND_TEMPLATE.to_string(),
        }
    }
}

/// Installs a headless JRE and JMeter on the default Ubuntu image.
pub fn default_setup() -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::new(
            "Install Java",
            "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq \
             --no-install-recommends openjdk-17-jre-headless wget ca-certificates",
        ),
        RemoteCommand::new(
            "Install JMeter",
            format!(
                "wget -q -O- https://archive.apache.org/dist/jmeter/binaries/apache-jmeter-{DEFAULT_JMETER_VERSION}.tgz \
                 | tar -xz -C /opt"
            ),
        ),
    ]
}

impl LoadTestPlan {
    pub fn validate(&self) -> Result<()> {
        if self.command_template.trim().is_empty() {
            return Err(Report::new(FleetError::InvalidSpec {
                message: "load-test command template is empty".to_string(),
            }));
        }
        for (placeholder, files) in [
            ("{scenario}", &self.scenarios),
            ("{properties}", &self.properties),
        ] {
            if self.command_template.contains(placeholder) && files.is_empty() {
                return Err(Report::new(FleetError::InvalidSpec {
                    message: format!("command template uses {placeholder} but no file was given"),
                }));
            }
        }
        Ok(())
    }

    /// Number of steps every worker plan has.
    pub fn steps_per_worker(&self) -> usize {
        self.setup.len()
            + usize::from(!self.scenarios.is_empty())
            + usize::from(!self.properties.is_empty())
            + 1
    }

    /// Build one plan per worker, handing out files round-robin.
    pub fn assign(&self, pod_names: &[String]) -> Vec<WorkerPlan> {
        pod_names
            .iter()
            .enumerate()
            .map(|(index, pod_name)| {
                let scenario = pick(&self.scenarios, index);
                let properties = pick(&self.properties, index);
                let info = TestInfo {
                    pod_name: pod_name.clone(),
                    scenario_file: scenario.map(TestFile::remote_path).unwrap_or_default(),
                    properties_file: properties.map(TestFile::remote_path).unwrap_or_default(),
                    results_file: format!("/tmp/{pod_name}-results.jtl"),
                };

                let mut steps = self.setup.clone();
                for file in scenario.into_iter().chain(properties) {
                    steps.push(upload_command(file));
                }
                steps.push(RemoteCommand::new(
                    "Run load test",
                    render_command(&self.command_template, &info),
                ));

                WorkerPlan { info, steps }
            })
            .collect()
    }
}

fn pick(files: &[TestFile], index: usize) -> Option<&TestFile> {
    if files.is_empty() {
        None
    } else {
        files.get(index % files.len())
    }
}

/// Command that writes `file` into the worker.
pub fn upload_command(file: &TestFile) -> RemoteCommand {
    let encoded = STANDARD.encode(&file.content);
    RemoteCommand::new(
        format!("Upload {}", file.name),
        format!(
            "mkdir -p {REMOTE_WORKDIR} && echo {} | base64 -d > {}",
            shell_quote(&encoded),
            shell_quote(&file.remote_path())
        ),
    )
}

/// Substitute `{scenario}`, `{properties}`, `{results}` and `{pod}`.
pub fn render_command(template: &str, info: &TestInfo) -> String {
    template
        .replace("{scenario}", &shell_quote(&info.scenario_file))
        .replace("{properties}", &shell_quote(&info.properties_file))
        .replace("{results}", &shell_quote(&info.results_file))
        .replace("{pod}", &info.pod_name)
}

/// Wrap `value` in single quotes for `/bin/sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("w-{i}")).collect()
    }

    fn plan() -> LoadTestPlan {
        LoadTestPlan {
            setup: vec![RemoteCommand::new("Setup", "true")],
            scenarios: vec![
                TestFile::new("plans/a.jmx", "<jmeterTestPlan/>"),
                TestFile::new("plans/b.jmx", "<jmeterTestPlan/>"),
            ],
            properties: vec![TestFile::new("env.properties", "threads=10\n")],
            command_template: "jmeter -n -t {scenario} -q {properties} -l {results} # {pod}"
                .to_string(),
        }
    }

    #[test]
    fn files_are_assigned_round_robin() {
        let plans = plan().assign(&names(3));

        let scenarios: Vec<&str> = plans.iter().map(|p| p.info.scenario_file.as_str()).collect();
        assert_eq!(
            scenarios,
            vec![
                "/tmp/podfleet/a.jmx",
                "/tmp/podfleet/b.jmx",
                "/tmp/podfleet/a.jmx"
            ]
        );
        assert!(plans
            .iter()
            .all(|p| p.info.properties_file == "/tmp/podfleet/env.properties"));
    }

    #[test]
    fn steps_are_setup_uploads_then_run() {
        let plans = plan().assign(&names(1));
        let steps: Vec<&str> = plans[0]
            .steps
            .iter()
            .map(|s| s.display_name.as_str())
            .collect();

        assert_eq!(
            steps,
            vec![
                "Setup",
                "Upload plans/a.jmx",
                "Upload env.properties",
                "Run load test"
            ]
        );
        assert_eq!(plans[0].steps.len(), plan().steps_per_worker());
        assert_eq!(
            plans[0].steps[3].command,
            "jmeter -n -t '/tmp/podfleet/a.jmx' -q '/tmp/podfleet/env.properties' \
             -l '/tmp/w-0-results.jtl' # w-0"
        );
    }

    #[test]
    fn upload_embeds_base64_content() {
        let step = upload_command(&TestFile::new("env.properties", "threads=10\n"));
        assert_eq!(
            step.command,
            "mkdir -p /tmp/podfleet && echo 'dGhyZWFkcz0xMAo=' | base64 -d > '/tmp/podfleet/env.properties'"
        );
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn template_placeholder_without_files_is_rejected() {
        let plan = LoadTestPlan::default();
        let err = plan.validate().unwrap_err();
        assert!(matches!(
            err.current_context(),
            FleetError::InvalidSpec { .. }
        ));
    }
}
