//! CLI argument parsing for the benchmark runner.
//!
//! Parsing stays thin: flags are turned into `CliOverrides` and a `Selection`
//! and everything else is decided by the config and workflow layers.
use crate::catalog::{parse_ids, parse_range, Selection};
use crate::config::CliOverrides;
use crate::error::ConfigError;
use crate::validation::ValidationMode;
use clap::{ArgGroup, Parser};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "xbench",
    version,
    about = "Run containerized capture-the-flag benchmarks against an agent",
    after_help = "Examples:\n  xbench --range 1-10\n  xbench --ids 1,5,10 --timeout 600 --model opus\n  xbench --all --pattern-flag --dry-run\n  xbench --resume\n  xbench --retry-failed logs/benchmark_run_20250101_120000",
    group(
        ArgGroup::new("selection")
            .args(["ids", "range", "all", "retry_failed"])
            .multiple(false)
    ),
    group(
        ArgGroup::new("validation_mode")
            .args(["validation", "any_flag", "pattern_flag"])
            .multiple(false)
    )
)]
pub struct RootArgs {
    /// Comma-separated benchmark numbers (e.g. 1,5,10)
    #[arg(long, value_name = "LIST")]
    pub ids: Option<String>,

    /// Inclusive benchmark number range ("1-10" or "1 10")
    #[arg(long, value_name = "RANGE")]
    pub range: Option<String>,

    /// Run every benchmark in the catalog
    #[arg(long)]
    pub all: bool,

    /// Rerun FAILURE, TIMEOUT and ERROR benchmarks of a prior session (default: latest)
    #[arg(long, value_name = "SESSION_DIR", num_args = 0..=1)]
    pub retry_failed: Option<Option<PathBuf>>,

    /// Continue a session in place, skipping benchmarks that succeeded (default: latest)
    #[arg(long, value_name = "SESSION_DIR", num_args = 0..=1, conflicts_with = "retry_failed")]
    pub resume: Option<Option<PathBuf>>,

    /// Print the resolved plan without building containers or running the agent
    #[arg(long)]
    pub dry_run: bool,

    /// Per-benchmark timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Flag validation policy
    #[arg(long, value_enum, value_name = "MODE")]
    pub validation: Option<ValidationMode>,

    /// Count any flag-shaped output as success (same as --validation any-flag)
    #[arg(long)]
    pub any_flag: bool,

    /// Count only FLAG{<32+ chars>} output as success (same as --validation pattern)
    #[arg(long)]
    pub pattern_flag: bool,

    /// Directory holding one subdirectory per benchmark
    #[arg(long, value_name = "DIR")]
    pub benchmarks_dir: Option<PathBuf>,

    /// Root directory for session output
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Agent command; the target URL is appended as the last argument
    #[arg(long, value_name = "CMD")]
    pub agent_command: Option<String>,

    /// Container engine binary
    #[arg(long, value_name = "BIN")]
    pub docker: Option<String>,

    /// Model passed to the agent (opus, sonnet, haiku, or a full identifier)
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// JSON config file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl RootArgs {
    pub fn validation_mode(&self) -> Option<ValidationMode> {
        if self.any_flag {
            Some(ValidationMode::AnyFlag)
        } else if self.pattern_flag {
            Some(ValidationMode::Pattern)
        } else {
            self.validation
        }
    }

    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config: self.config.clone(),
            benchmarks_dir: self.benchmarks_dir.clone(),
            output_dir: self.output_dir.clone(),
            timeout_seconds: self.timeout,
            validation: self.validation_mode(),
            agent_command: self.agent_command.clone(),
            docker: self.docker.clone(),
            model: self.model.clone(),
        }
    }

    /// Explicit catalog selection, if one was given.
    pub fn selection(&self) -> Result<Option<Selection>, ConfigError> {
        if let Some(ids) = &self.ids {
            return parse_ids(ids).map(Some);
        }
        if let Some(range) = &self.range {
            return parse_range(range).map(Some);
        }
        Ok(self.all.then_some(Selection::All))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<RootArgs, clap::Error> {
        RootArgs::try_parse_from(std::iter::once("xbench").chain(args.iter().copied()))
    }

    #[test]
    fn validation_switches_are_mutually_exclusive() {
        assert!(parse(&["--all", "--any-flag", "--pattern-flag"]).is_err());
        assert!(parse(&["--all", "--validation", "exact", "--any-flag"]).is_err());
        let args = parse(&["--all", "--pattern-flag"]).unwrap();
        assert_eq!(args.validation_mode(), Some(ValidationMode::Pattern));
        let args = parse(&["--all", "--validation", "any-flag"]).unwrap();
        assert_eq!(args.overrides().validation, Some(ValidationMode::AnyFlag));
        assert_eq!(parse(&["--all"]).unwrap().validation_mode(), None);
    }

    #[test]
    fn selection_flags_are_mutually_exclusive() {
        assert!(parse(&["--ids", "1", "--range", "1-3"]).is_err());
        assert!(parse(&["--all", "--retry-failed"]).is_err());
        assert!(parse(&["--resume", "--retry-failed"]).is_err());
        assert_eq!(
            parse(&["--range", "2-4"]).unwrap().selection().unwrap(),
            Some(Selection::Range { start: 2, end: 4 })
        );
        assert_eq!(parse(&["--resume"]).unwrap().selection().unwrap(), None);
    }

    #[test]
    fn session_dir_is_optional_for_resume_and_retry() {
        let args = parse(&["--retry-failed"]).unwrap();
        assert_eq!(args.retry_failed, Some(None));
        let args = parse(&["--retry-failed", "logs/benchmark_run_1"]).unwrap();
        assert_eq!(
            args.retry_failed,
            Some(Some(PathBuf::from("logs/benchmark_run_1")))
        );
        let args = parse(&["--resume", "--range", "1-2"]).unwrap();
        assert_eq!(args.resume, Some(None));
        assert!(parse(&["--all"]).unwrap().resume.is_none());
    }
}
