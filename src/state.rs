//! Durable, resumable run state.
//!
//! A session is persisted as `state.json` inside its session directory and
//! rewritten in full after every recorded trial. Writes go through a
//! temp-file-and-rename so external readers never see a partial file.
use crate::catalog::BenchmarkDefinition;
use crate::container::Stage;
use crate::error::StateError;
use crate::util::atomic_write;
use crate::validation::ValidationMode;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "state.json";
pub const SESSION_DIR_PREFIX: &str = "benchmark_run_";
pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialOutcome {
    Success,
    Failure,
    Timeout,
    Error,
}

impl TrialOutcome {
    pub fn label(self) -> &'static str {
        match self {
            TrialOutcome::Success => "SUCCESS",
            TrialOutcome::Failure => "FAILURE",
            TrialOutcome::Timeout => "TIMEOUT",
            TrialOutcome::Error => "ERROR",
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, TrialOutcome::Success)
    }
}

impl std::fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Why the agent subprocess stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    Marker,
    Timeout,
    NaturalExit,
    Cancelled,
}

/// One trial attempt. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub benchmark_id: String,
    pub benchmark_name: String,
    pub level: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    pub outcome: TrialOutcome,
    /// Failing infrastructure stage for `ERROR` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_seconds: Option<f64>,
    pub cost_usd: Option<f64>,
    pub expected_flag: String,
    #[serde(default)]
    pub found_flags: Vec<String>,
    /// Flag count the agent itself reported on its completion line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_flags: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_errors: Vec<String>,
    /// Teardown problems; never change the outcome.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.outcome == TrialOutcome::Success
    }

    /// Short operator-facing reason for a non-success outcome.
    pub fn failure_reason(&self) -> String {
        match self.outcome {
            TrialOutcome::Success => "solved".to_string(),
            TrialOutcome::Timeout => {
                format!("timeout after {}m", (self.duration_seconds / 60.0) as u64)
            }
            TrialOutcome::Error => match (&self.stage, &self.error_message) {
                (Some(stage), Some(message)) => format!("[{stage}] {message}"),
                (None, Some(message)) => message.clone(),
                (Some(stage), None) => format!("[{stage}] unknown error"),
                (None, None) => "unknown error".to_string(),
            },
            TrialOutcome::Failure if self.found_flags.is_empty() => "no flags found".to_string(),
            TrialOutcome::Failure => "incorrect flag".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Cancelled,
}

/// Whether `record` stored a result or kept an earlier success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Stored,
    KeptSuccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSession {
    pub schema_version: u32,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub benchmark_ids: Vec<String>,
    pub validation_mode: ValidationMode,
    pub timeout_seconds: u64,
    pub status: SessionStatus,
    #[serde(default)]
    pub results: BTreeMap<String, ExecutionResult>,
}

impl RunSession {
    /// Start a session named after the local start time under `output_root`.
    pub fn create(
        output_root: &Path,
        benchmark_ids: Vec<String>,
        validation_mode: ValidationMode,
        timeout_seconds: u64,
    ) -> Self {
        let now = Local::now();
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let mut session_id = stamp.clone();
        let mut output_dir = output_root.join(format!("{SESSION_DIR_PREFIX}{session_id}"));
        // Two runs started within the same second get distinct directories.
        let mut suffix = 1;
        while output_dir.exists() {
            suffix += 1;
            session_id = format!("{stamp}_{suffix}");
            output_dir = output_root.join(format!("{SESSION_DIR_PREFIX}{session_id}"));
        }
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            session_id,
            created_at: now.with_timezone(&Utc),
            output_dir,
            benchmark_ids,
            validation_mode,
            timeout_seconds,
            status: SessionStatus::Running,
            results: BTreeMap::new(),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.output_dir.join(STATE_FILE)
    }

    /// Load the session stored in `session_dir`.
    pub fn load(session_dir: &Path) -> Result<Self, StateError> {
        let path = session_dir.join(STATE_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::Missing(path));
            }
            Err(source) => return Err(StateError::Io { path, source }),
        };
        let mut session: RunSession = serde_json::from_slice(&bytes)
            .map_err(|source| StateError::Corrupt { path, source })?;
        // The directory may have moved since the state was written.
        session.output_dir = session_dir.to_path_buf();
        Ok(session)
    }

    pub fn save(&self) -> Result<(), StateError> {
        let path = self.state_path();
        let io_err = |source| StateError::Io {
            path: path.clone(),
            source,
        };
        let mut bytes = serde_json::to_vec_pretty(self)
            .map_err(|err| io_err(std::io::Error::other(err)))?;
        bytes.push(b'\n');
        atomic_write(&path, &bytes).map_err(io_err)
    }

    /// Append one result and persist the whole session.
    ///
    /// An existing `SUCCESS` entry is never replaced.
    pub fn record(&mut self, result: ExecutionResult) -> Result<Recorded, StateError> {
        if self
            .results
            .get(&result.benchmark_id)
            .is_some_and(ExecutionResult::success)
        {
            tracing::warn!(
                benchmark = %result.benchmark_id,
                "refusing to overwrite a recorded success"
            );
            return Ok(Recorded::KeptSuccess);
        }
        if !self.benchmark_ids.contains(&result.benchmark_id) {
            self.benchmark_ids.push(result.benchmark_id.clone());
        }
        self.results.insert(result.benchmark_id.clone(), result);
        self.save()?;
        Ok(Recorded::Stored)
    }

    pub fn set_status(&mut self, status: SessionStatus) -> Result<(), StateError> {
        self.status = status;
        self.save()
    }

    pub fn last_outcome(&self, benchmark_id: &str) -> Option<TrialOutcome> {
        self.results.get(benchmark_id).map(|result| result.outcome)
    }

    /// Catalog entries with no recorded result or a non-success result.
    pub fn selectable_for_resume<'a>(
        &self,
        catalog: &[&'a BenchmarkDefinition],
    ) -> Vec<&'a BenchmarkDefinition> {
        catalog
            .iter()
            .copied()
            .filter(|definition| self.last_outcome(&definition.id) != Some(TrialOutcome::Success))
            .collect()
    }

    /// Identifiers whose last outcome was FAILURE, TIMEOUT, or ERROR.
    pub fn selectable_for_retry(&self) -> Vec<&ExecutionResult> {
        self.results
            .values()
            .filter(|result| result.outcome.is_retryable())
            .collect()
    }

    /// Results in the session's selection order.
    pub fn ordered_results(&self) -> Vec<&ExecutionResult> {
        let mut ordered: Vec<&ExecutionResult> = self
            .benchmark_ids
            .iter()
            .filter_map(|id| self.results.get(id))
            .collect();
        for (id, result) in &self.results {
            if !self.benchmark_ids.contains(id) {
                ordered.push(result);
            }
        }
        ordered
    }
}

/// Most recent `benchmark_run_*` directory under `output_root`.
pub fn find_latest_session(output_root: &Path) -> Result<PathBuf, StateError> {
    let entries = match fs::read_dir(output_root) {
        Ok(entries) => entries,
        Err(_) => return Err(StateError::NoPriorRun(output_root.to_path_buf())),
    };
    entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            let key = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(SESSION_DIR_PREFIX))
                .map(session_order_key)?;
            Some((key, path))
        })
        .max()
        .map(|(_, path)| path)
        .ok_or_else(|| StateError::NoPriorRun(output_root.to_path_buf()))
}

/// `20250101_120000_10` sorts as (`20250101_120000`, 10); no suffix counts as 1.
fn session_order_key(id: &str) -> (String, u32) {
    match id.rsplit_once('_') {
        Some((stamp, suffix)) if stamp.contains('_') => {
            (stamp.to_string(), suffix.parse().unwrap_or(1))
        }
        _ => (id.to_string(), 1),
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
