//! Layered run configuration: CLI > environment > config file > defaults.
//!
//! Everything is resolved into one `RunConfig` before the first trial. The
//! validation mode is a single enum value, so no resolved configuration can
//! ask for two modes at once.
use crate::agent::AgentSettings;
use crate::container::LifecycleSettings;
use crate::error::ConfigError;
use crate::validation::ValidationMode;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BENCHMARKS_DIR: &str = "benchmarks";
pub const DEFAULT_OUTPUT_DIR: &str = "logs";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 900;
pub const DEFAULT_AGENT_COMMAND: &str = "pentestgpt --non-interactive --raw --target";
pub const DEFAULT_DOCKER: &str = "docker";
pub const DEFAULT_TARGET_HOST: &str = "host.docker.internal";

pub const ENV_CONFIG: &str = "XBENCH_CONFIG";
pub const ENV_BENCHMARKS_DIR: &str = "XBENCH_BENCHMARKS_DIR";
pub const ENV_OUTPUT_DIR: &str = "XBENCH_OUTPUT_DIR";
pub const ENV_TIMEOUT: &str = "XBENCH_TIMEOUT";
pub const ENV_AGENT_COMMAND: &str = "XBENCH_AGENT_COMMAND";
pub const ENV_DOCKER: &str = "XBENCH_DOCKER";
pub const ENV_TARGET_HOST: &str = "XBENCH_TARGET_HOST";
pub const ENV_MODEL: &str = "XBENCH_MODEL";

const MODEL_ALIASES: &[(&str, &str)] = &[
    ("opus", "claude-opus-4-5-20251101"),
    ("sonnet", "claude-sonnet-4-5-20250929"),
    ("haiku", "claude-haiku-4-5-20251001"),
];

/// On-disk config file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub benchmarks_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub timeout_seconds: Option<u64>,
    pub build_timeout_seconds: Option<u64>,
    pub start_timeout_seconds: Option<u64>,
    pub teardown_timeout_seconds: Option<u64>,
    pub health_check_attempts: Option<u32>,
    pub health_check_interval_seconds: Option<u64>,
    pub port_discovery_attempts: Option<u32>,
    pub port_backoff_seconds: Option<u64>,
    pub terminate_grace_seconds: Option<u64>,
    pub agent_command: Option<String>,
    pub docker: Option<String>,
    pub target_host: Option<String>,
    pub model: Option<String>,
    pub validation: Option<ValidationMode>,
}

/// Values given on the command line; `None` defers to lower layers.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub benchmarks_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub timeout_seconds: Option<u64>,
    pub validation: Option<ValidationMode>,
    pub agent_command: Option<String>,
    pub docker: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub benchmarks_dir: PathBuf,
    pub output_dir: PathBuf,
    pub timeout: Duration,
    pub validation: ValidationMode,
    pub agent: AgentSettings,
    pub lifecycle: LifecycleSettings,
    pub docker: String,
    pub target_host: String,
    /// Config file that contributed values, if any.
    pub config_file: Option<PathBuf>,
}

impl RunConfig {
    /// Absolute path of the container engine binary.
    pub fn docker_path(&self) -> Result<PathBuf, ConfigError> {
        which::which(&self.docker).map_err(|err| ConfigError::MissingProgram {
            program: self.docker.clone(),
            message: err.to_string(),
        })
    }
}

pub fn target_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}")
}

/// Resolve against the process environment and the user config directory.
pub fn resolve(cli: &CliOverrides) -> Result<RunConfig, ConfigError> {
    let default_file = dirs::config_dir().map(|dir| dir.join("xbench").join("config.json"));
    resolve_with(cli, |name| std::env::var(name).ok(), default_file.as_deref())
}

fn resolve_with(
    cli: &CliOverrides,
    env: impl Fn(&str) -> Option<String>,
    default_file: Option<&Path>,
) -> Result<RunConfig, ConfigError> {
    let env = |name: &str| env(name).filter(|value| !value.trim().is_empty());
    let explicit_file = cli.config.clone().or_else(|| env(ENV_CONFIG).map(PathBuf::from));
    let (file, config_file) = match explicit_file {
        Some(path) => (load_file(&path)?, Some(path)),
        None => match default_file.filter(|path| path.is_file()) {
            Some(path) => (load_file(path)?, Some(path.to_path_buf())),
            None => (FileConfig::default(), None),
        },
    };

    let env_timeout = env(ENV_TIMEOUT)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_TIMEOUT,
                    value: value.clone(),
                })
        })
        .transpose()?;
    let timeout_seconds = cli
        .timeout_seconds
        .or(env_timeout)
        .or(file.timeout_seconds)
        .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
    let timeout = seconds("timeout", timeout_seconds)?;

    let defaults = LifecycleSettings::default();
    let lifecycle = LifecycleSettings {
        build_timeout: optional_seconds("build_timeout_seconds", file.build_timeout_seconds)?
            .unwrap_or(defaults.build_timeout),
        start_timeout: optional_seconds("start_timeout_seconds", file.start_timeout_seconds)?
            .unwrap_or(defaults.start_timeout),
        teardown_timeout: optional_seconds(
            "teardown_timeout_seconds",
            file.teardown_timeout_seconds,
        )?
        .unwrap_or(defaults.teardown_timeout),
        health_attempts: positive("health_check_attempts", file.health_check_attempts)?
            .unwrap_or(defaults.health_attempts),
        health_interval: file
            .health_check_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.health_interval),
        port_attempts: positive("port_discovery_attempts", file.port_discovery_attempts)?
            .unwrap_or(defaults.port_attempts),
        port_backoff: file
            .port_backoff_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.port_backoff),
        port_backoff_max: defaults.port_backoff_max,
        terminate_grace: file
            .terminate_grace_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.terminate_grace),
    };

    let agent_command = cli
        .agent_command
        .clone()
        .or_else(|| env(ENV_AGENT_COMMAND))
        .or(file.agent_command)
        .unwrap_or_else(|| DEFAULT_AGENT_COMMAND.to_string());
    let model = cli
        .model
        .clone()
        .or_else(|| env(ENV_MODEL))
        .or(file.model)
        .map(|name| resolve_model(&name));

    Ok(RunConfig {
        benchmarks_dir: cli
            .benchmarks_dir
            .clone()
            .or_else(|| env(ENV_BENCHMARKS_DIR).map(PathBuf::from))
            .or(file.benchmarks_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BENCHMARKS_DIR)),
        output_dir: cli
            .output_dir
            .clone()
            .or_else(|| env(ENV_OUTPUT_DIR).map(PathBuf::from))
            .or(file.output_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
        timeout,
        validation: cli.validation.or(file.validation).unwrap_or_default(),
        agent: AgentSettings {
            command: split_command(&agent_command)?,
            model,
            timeout,
            terminate_grace: lifecycle.terminate_grace,
        },
        docker: cli
            .docker
            .clone()
            .or_else(|| env(ENV_DOCKER))
            .or(file.docker)
            .unwrap_or_else(|| DEFAULT_DOCKER.to_string()),
        target_host: env(ENV_TARGET_HOST)
            .or(file.target_host)
            .unwrap_or_else(|| DEFAULT_TARGET_HOST.to_string()),
        lifecycle,
        config_file,
    })
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let file_err = |message: String| ConfigError::File {
        path: path.to_path_buf(),
        message,
    };
    let bytes = fs::read(path).map_err(|err| file_err(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| file_err(err.to_string()))
}

fn seconds(field: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::NonPositive { field });
    }
    Ok(Duration::from_secs(value))
}

fn optional_seconds(
    field: &'static str,
    value: Option<u64>,
) -> Result<Option<Duration>, ConfigError> {
    value.map(|value| seconds(field, value)).transpose()
}

fn positive(field: &'static str, value: Option<u32>) -> Result<Option<u32>, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::NonPositive { field }),
        other => Ok(other),
    }
}

/// Split the agent command with shell quoting rules.
pub fn split_command(command: &str) -> Result<Vec<String>, ConfigError> {
    let words = shell_words::split(command).map_err(|err| ConfigError::AgentCommand {
        command: command.to_string(),
        message: err.to_string(),
    })?;
    if words.is_empty() {
        return Err(ConfigError::EmptyAgentCommand);
    }
    Ok(words)
}

/// Map a short model alias to its full identifier; anything else passes through.
pub fn resolve_model(name: &str) -> String {
    let name = name.trim();
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
        .map(|(_, full)| full.to_string())
        .unwrap_or_else(|| name.to_string())
}
