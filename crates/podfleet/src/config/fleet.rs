//! Fleet settings from a YAML file and CLI flags
//!
//! Every knob may come from `--fleet-file`; a flag given on the command line
//! wins over the file, and built-in defaults fill the rest. Relative file paths
//! inside the fleet file are resolved against the file's directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Deserializer};

use crate::config::cli::RunArgs;
use crate::domain::orchestrator::{FleetSpec, QuorumPolicy};
use crate::domain::plan::{default_setup, LoadTestPlan, TestFile, DEFAULT_COMMAND_TEMPLATE};
use crate::domain::pod_spec::{WorkerTemplate, DEFAULT_APP_LABEL, DEFAULT_IMAGE};
use crate::domain::readiness::{ReadinessPolicy, DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT};
use crate::domain::session::RunConfig;
use crate::domain::types::RemoteCommand;

pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_NAME_PREFIX: &str = "jmeter-worker";
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse fleet file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid quorum {0:?}, expected `all`, a worker count or a percentage like `80%`")]
    InvalidQuorum(String),
    #[error("{0}")]
    Invalid(String),
}

/// Fleet shape flags shared by `run`, `exec` and `teardown`
#[derive(Args, Clone, Debug, Default)]
pub struct FleetArgs {
    #[arg(
        long,
        env = "PODFLEET_FLEET_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML fleet file, flags override its values"
    )]
    pub fleet_file: Option<PathBuf>,

    #[arg(
        long,
        short = 'n',
        env = "PODFLEET_NAMESPACE",
        help = "Namespace for the workers (defaults to the kubeconfig context's namespace)"
    )]
    pub namespace: Option<String>,

    #[arg(long, help = "Number of worker pods [default: 3]")]
    pub workers: Option<usize>,

    #[arg(long, help = "Worker names are <prefix>-<index> [default: jmeter-worker]")]
    pub name_prefix: Option<String>,

    #[arg(long, help = "Container image of every worker [default: ubuntu:22.04]")]
    pub image: Option<String>,

    #[arg(long, help = "Value of the `app` label marking fleet pods [default: jmeter_pod]")]
    pub app_label: Option<String>,

    #[arg(long, help = "Seconds a worker stays alive without work [default: 3600]")]
    pub keep_alive_secs: Option<u64>,

    #[arg(long, help = "Seconds to wait for each worker to become ready [default: 30]")]
    pub ready_timeout_secs: Option<u64>,

    #[arg(long, help = "Seconds between readiness polls [default: 3]")]
    pub poll_interval_secs: Option<u64>,

    #[arg(
        long,
        value_parser = parse_quorum,
        help = "Ready workers needed to run: `all`, a count, or a percentage like `80%` [default: all]"
    )]
    pub quorum: Option<QuorumPolicy>,
}

/// Contents of a fleet file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct FleetFile {
    pub namespace: Option<String>,
    pub workers: Option<usize>,
    pub name_prefix: Option<String>,
    pub image: Option<String>,
    pub app_label: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub ready_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    #[serde(deserialize_with = "deserialize_quorum")]
    pub quorum: Option<QuorumPolicy>,
    pub deadline_secs: Option<u64>,
    pub command_template: Option<String>,
    pub scenarios: Vec<PathBuf>,
    pub properties: Vec<PathBuf>,
    pub setup: Option<Vec<SetupStep>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SetupStep {
    pub name: String,
    pub command: String,
}

/// Fleet settings after merging file, flags and defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFleet {
    pub spec: FleetSpec,
    pub template: WorkerTemplate,
    pub readiness: ReadinessPolicy,
}

/// Parse `all`, `<count>` or `<percent>%`.
pub fn parse_quorum(value: &str) -> Result<QuorumPolicy, ConfigError> {
    let value = value.trim();
    let invalid = || ConfigError::InvalidQuorum(value.to_string());

    if value.eq_ignore_ascii_case("all") {
        return Ok(QuorumPolicy::All);
    }
    if let Some(percent) = value.strip_suffix('%') {
        let percent: u8 = percent.trim().parse().map_err(|_| invalid())?;
        if percent == 0 || percent > 100 {
            return Err(invalid());
        }
        return Ok(QuorumPolicy::Percent(percent));
    }
    match value.parse::<usize>() {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(count) => Ok(QuorumPolicy::AtLeast(count)),
    }
}

fn deserialize_quorum<'de, D>(deserializer: D) -> Result<Option<QuorumPolicy>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrCount {
        String(String),
        Count(usize),
    }

    match Option::<StringOrCount>::deserialize(deserializer)? {
        None => Ok(None),
        Some(StringOrCount::String(s)) => parse_quorum(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(StringOrCount::Count(count)) => parse_quorum(&count.to_string())
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

impl FleetFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = read_file(path)?;
        serde_yaml::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl FleetArgs {
    /// The fleet file, or an empty one when none was given, plus the directory
    /// its relative paths are resolved against.
    pub fn load_file(&self) -> Result<(FleetFile, PathBuf), ConfigError> {
        match &self.fleet_file {
            Some(path) => {
                let file = FleetFile::load(path)?;
                let base = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                Ok((file, base))
            }
            None => Ok((FleetFile::default(), PathBuf::new())),
        }
    }

    pub fn resolve(&self, default_namespace: &str) -> Result<ResolvedFleet, ConfigError> {
        let (file, _) = self.load_file()?;
        self.merge(&file, default_namespace)
    }

    pub fn merge(
        &self,
        file: &FleetFile,
        default_namespace: &str,
    ) -> Result<ResolvedFleet, ConfigError> {
        let secs = |flag: Option<u64>, from_file: Option<u64>, default: Duration| {
            flag.or(from_file).map(Duration::from_secs).unwrap_or(default)
        };

        let spec = FleetSpec {
            namespace: self
                .namespace
                .clone()
                .or_else(|| file.namespace.clone())
                .unwrap_or_else(|| default_namespace.to_string()),
            name_prefix: self
                .name_prefix
                .clone()
                .or_else(|| file.name_prefix.clone())
                .unwrap_or_else(|| DEFAULT_NAME_PREFIX.to_string()),
            workers: self.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS),
            keep_alive_secs: self
                .keep_alive_secs
                .or(file.keep_alive_secs)
                .unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            ready_timeout: None,
            quorum: self.quorum.or(file.quorum).unwrap_or_default(),
        };
        spec.validate()
            .map_err(|e| ConfigError::Invalid(e.current_context().to_string()))?;

        let readiness = ReadinessPolicy {
            interval: secs(
                self.poll_interval_secs,
                file.poll_interval_secs,
                DEFAULT_POLL_INTERVAL,
            ),
            timeout: secs(
                self.ready_timeout_secs,
                file.ready_timeout_secs,
                DEFAULT_READY_TIMEOUT,
            ),
        };
        if readiness.interval.is_zero() || readiness.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "readiness timeout and poll interval must be at least one second".to_string(),
            ));
        }

        let template = WorkerTemplate {
            image: self
                .image
                .clone()
                .or_else(|| file.image.clone())
                .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            app_label: self
                .app_label
                .clone()
                .or_else(|| file.app_label.clone())
                .unwrap_or_else(|| DEFAULT_APP_LABEL.to_string()),
        };

        Ok(ResolvedFleet {
            spec,
            template,
            readiness,
        })
    }
}

impl RunArgs {
    /// Fleet settings plus the load-test plan, with scenario and properties
    /// files read into memory.
    pub fn resolve(&self, default_namespace: &str) -> Result<(ResolvedFleet, RunConfig), ConfigError> {
        let (file, base) = self.fleet.load_file()?;
        let fleet = self.fleet.merge(&file, default_namespace)?;

        let from_file = |paths: &[PathBuf]| -> Vec<PathBuf> {
            paths.iter().map(|p| base.join(p)).collect()
        };
        let scenarios = if self.scenarios.is_empty() {
            from_file(&file.scenarios)
        } else {
            self.scenarios.clone()
        };
        let properties = if self.properties.is_empty() {
            from_file(&file.properties)
        } else {
            self.properties.clone()
        };

        let setup = if self.skip_setup {
            Vec::new()
        } else {
            match &file.setup {
                Some(steps) => steps
                    .iter()
                    .map(|s| RemoteCommand::new(&s.name, &s.command))
                    .collect(),
                None => default_setup(),
            }
        };

        let plan = LoadTestPlan {
            setup,
            scenarios: load_test_files(&scenarios)?,
            properties: load_test_files(&properties)?,
            command_template: self
                .command_template
                .clone()
                .or_else(|| file.command_template.clone())
                .unwrap_or_else(|| DEFAULT_COMMAND_TEMPLATE.to_string()),
        };
        plan.validate()
            .map_err(|e| ConfigError::Invalid(e.current_context().to_string()))?;

        let run = RunConfig {
            spec: fleet.spec.clone(),
            plan,
            deadline: self
                .deadline_secs
                .or(file.deadline_secs)
                .map(Duration::from_secs),
        };
        Ok((fleet, run))
    }
}

fn load_test_files(paths: &[PathBuf]) -> Result<Vec<TestFile>, ConfigError> {
    paths
        .iter()
        .map(|path| read_file(path).map(|content| TestFile::new(path.display().to_string(), content)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn run_args(fleet: FleetArgs) -> RunArgs {
        RunArgs {
            fleet,
            scenarios: Vec::new(),
            properties: Vec::new(),
            command_template: None,
            skip_setup: false,
            deadline_secs: None,
            yes: false,
            keep_fleet: false,
            report: None,
        }
    }

    #[test]
    fn defaults_apply_without_file_or_flags() {
        let fleet = FleetArgs::default().resolve("team-a").unwrap();

        assert_eq!(
            fleet.spec,
            FleetSpec {
                namespace: "team-a".to_string(),
                name_prefix: "jmeter-worker".to_string(),
                workers: 3,
                keep_alive_secs: 3600,
                ready_timeout: None,
                quorum: QuorumPolicy::All,
            }
        );
        assert_eq!(fleet.template, WorkerTemplate::default());
        assert_eq!(fleet.readiness, ReadinessPolicy::default());
    }

    #[test]
    fn flags_override_fleet_file() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "fleet.yaml",
            "namespace: loadtest\nworkers: 5\nimage: jmeter:5.6\nquorum: \"60%\"\nreadyTimeoutSecs: 90\n",
        );
        let args = FleetArgs {
            fleet_file: Some(path),
            workers: Some(2),
            ..Default::default()
        };

        let fleet = args.resolve("default").unwrap();
        assert_eq!(fleet.spec.namespace, "loadtest");
        assert_eq!(fleet.spec.workers, 2);
        assert_eq!(fleet.spec.quorum, QuorumPolicy::Percent(60));
        assert_eq!(fleet.template.image, "jmeter:5.6");
        assert_eq!(fleet.readiness.timeout, Duration::from_secs(90));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "fleet.yaml", "replicas: 3\n");
        let args = FleetArgs {
            fleet_file: Some(path),
            ..Default::default()
        };

        assert!(matches!(
            args.resolve("default"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn quorum_forms() {
        assert_eq!(parse_quorum("all").unwrap(), QuorumPolicy::All);
        assert_eq!(parse_quorum("ALL").unwrap(), QuorumPolicy::All);
        assert_eq!(parse_quorum("2").unwrap(), QuorumPolicy::AtLeast(2));
        assert_eq!(parse_quorum("75%").unwrap(), QuorumPolicy::Percent(75));
        for bad in ["0", "0%", "101%", "most", ""] {
            assert!(parse_quorum(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn zero_workers_is_invalid() {
        let args = FleetArgs {
            workers: Some(0),
            ..Default::default()
        };
        assert!(matches!(args.resolve("default"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn run_plan_reads_files_relative_to_fleet_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "checkout.jmx", "<jmeterTestPlan/>");
        write(&dir, "env.properties", "threads=10\n");
        let path = write(
            &dir,
            "fleet.yaml",
            "scenarios: [checkout.jmx]\nproperties: [env.properties]\ndeadlineSecs: 600\n\
             setup:\n  - name: Noop\n    command: \"true\"\n",
        );

        let args = run_args(FleetArgs {
            fleet_file: Some(path),
            ..Default::default()
        });
        let (_, run) = args.resolve("default").unwrap();

        assert_eq!(run.deadline, Some(Duration::from_secs(600)));
        assert_eq!(run.plan.setup, vec![RemoteCommand::new("Noop", "true")]);
        assert_eq!(run.plan.scenarios[0].content, b"<jmeterTestPlan/>".to_vec());
        assert_eq!(run.plan.properties[0].content, b"threads=10\n".to_vec());
        assert_eq!(run.plan.command_template, DEFAULT_COMMAND_TEMPLATE);
    }

    #[test]
    fn default_command_needs_a_scenario() {
        let args = run_args(FleetArgs::default());
        assert!(matches!(args.resolve("default"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_scenario_file_is_reported() {
        let mut args = run_args(FleetArgs::default());
        args.scenarios = vec![PathBuf::from("/nonexistent/plan.jmx")];

        let err = args.resolve("default").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/plan.jmx"));
    }

    #[test]
    fn skip_setup_and_custom_command() {
        let mut args = run_args(FleetArgs::default());
        args.skip_setup = true;
        args.command_template = Some("echo {pod}".to_string());

        let (_, run) = args.resolve("default").unwrap();
        assert!(run.plan.setup.is_empty());
        assert_eq!(run.plan.command_template, "echo {pod}");
    }
}
