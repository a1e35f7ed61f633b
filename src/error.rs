//! Error taxonomy for the benchmark runner.
//!
//! Catalog, config, and state errors are fatal and only surface before the
//! first trial starts. `TrialError` never escapes a trial: the orchestrator
//! converts it into an `ERROR` result. Timeouts and validation misses are
//! outcomes, not errors, and have no variant here.
use crate::container::Stage;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("benchmarks directory not found: {}", .0.display())]
    MissingRoot(PathBuf),
    #[error("read benchmarks directory {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no valid benchmark definitions under {}", .0.display())]
    Empty(PathBuf),
    #[error("selection matched no benchmarks in the catalog")]
    EmptySelection,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid range {0:?}: use '1-10' or '1 10' with start <= end")]
    InvalidRange(String),
    #[error("invalid benchmark id list {0:?}: expected comma-separated numbers")]
    InvalidIds(String),
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },
    #[error("agent command is empty")]
    EmptyAgentCommand,
    #[error("parse agent command {command:?}: {message}")]
    AgentCommand { command: String, message: String },
    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("read config {}: {message}", .path.display())]
    File { path: PathBuf, message: String },
    #[error("no benchmarks selected: use --ids, --range, --all, --retry-failed or --resume")]
    NoSelection,
    #[error("{program} not found on PATH: {message}")]
    MissingProgram { program: String, message: String },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no run state at {}", .0.display())]
    Missing(PathBuf),
    #[error("no previous benchmark runs under {}", .0.display())]
    NoPriorRun(PathBuf),
    #[error("corrupt run state {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("persist run state {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-trial failure, recorded as an `ERROR` outcome or used to unwind a
/// cancelled trial.
#[derive(Debug, Error)]
pub enum TrialError {
    #[error("{stage} failed: {message}")]
    Environment { stage: Stage, message: String },
    #[error("agent could not be launched: {0}")]
    Execution(String),
    #[error("cancelled during {0}")]
    Cancelled(Stage),
}

impl TrialError {
    pub fn environment(stage: Stage, message: impl Into<String>) -> Self {
        TrialError::Environment {
            stage,
            message: message.into(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            TrialError::Environment { stage, .. } => *stage,
            TrialError::Execution(_) => Stage::Execute,
            TrialError::Cancelled(stage) => *stage,
        }
    }
}
