//! Command-level flows: fresh batch, resume, retry-failed, and dry run.
//!
//! Everything fatal (catalog, config, state) is resolved here before the
//! first trial starts; after that only an interrupt ends the run early.
use crate::agent::AgentExecutor;
use crate::cancel::{self, CancelToken};
use crate::catalog::{BenchmarkDefinition, Catalog, Selection};
use crate::cli::RootArgs;
use crate::config::{self, RunConfig};
use crate::container::ComposeEngine;
use crate::error::ConfigError;
use crate::orchestrator::{print_plan, run_batch, BatchOutcome, RunContext};
use crate::report::{print_totals, Reporter, RunSummary};
use crate::state::{find_latest_session, RunSession, SessionStatus};
use crate::util::display_path;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Completed,
    Cancelled,
}

pub fn run(args: RootArgs) -> Result<RunExit> {
    let config = config::resolve(&args.overrides())?;
    let selection = args.selection()?;
    tracing::info!(
        benchmarks = %config.benchmarks_dir.display(),
        output = %config.output_dir.display(),
        validation = %config.validation,
        timeout_s = config.timeout.as_secs(),
        config_file = ?config.config_file,
        "configuration resolved"
    );
    let catalog = Catalog::load(&config.benchmarks_dir)?;
    eprintln!(
        "Loaded {} benchmarks from {}",
        catalog.entries().len(),
        catalog.root().display()
    );

    if let Some(session_dir) = &args.retry_failed {
        return run_retry(&config, &catalog, session_dir.as_deref(), args.dry_run);
    }
    if let Some(session_dir) = &args.resume {
        return run_resume(
            &config,
            &catalog,
            session_dir.as_deref(),
            selection.as_ref(),
            args.dry_run,
        );
    }

    let selection = selection.ok_or(ConfigError::NoSelection)?;
    let plan = catalog.select(&selection)?;
    let timeout_seconds = config.timeout.as_secs();
    if args.dry_run {
        print_plan(&plan, None, config.validation, timeout_seconds);
        return Ok(RunExit::Completed);
    }
    let session = RunSession::create(
        &config.output_dir,
        plan.iter().map(|benchmark| benchmark.id.clone()).collect(),
        config.validation,
        timeout_seconds,
    );
    execute(&config, session, &plan)
}

fn session_dir(explicit: Option<&Path>, output_root: &Path) -> Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir.to_path_buf()),
        None => Ok(find_latest_session(output_root)?),
    }
}

fn run_retry(
    config: &RunConfig,
    catalog: &Catalog,
    explicit: Option<&Path>,
    dry_run: bool,
) -> Result<RunExit> {
    let dir = session_dir(explicit, &config.output_dir)?;
    let prior = RunSession::load(&dir)?;
    let ids: Vec<&str> = prior
        .selectable_for_retry()
        .iter()
        .map(|result| result.benchmark_id.as_str())
        .collect();
    let plan = catalog.select_ids(&ids);
    if plan.is_empty() {
        println!(
            "nothing to retry in {}",
            display_path(&dir, Some(&config.output_dir))
        );
        return Ok(RunExit::Completed);
    }
    let timeout_seconds = config.timeout.as_secs();
    if dry_run {
        println!("Retrying from {}", dir.display());
        print_plan(&plan, Some(&prior), config.validation, timeout_seconds);
        return Ok(RunExit::Completed);
    }
    let session = RunSession::create(
        &config.output_dir,
        plan.iter().map(|benchmark| benchmark.id.clone()).collect(),
        config.validation,
        timeout_seconds,
    );
    execute(config, session, &plan)
}

fn run_resume(
    config: &RunConfig,
    catalog: &Catalog,
    explicit: Option<&Path>,
    selection: Option<&Selection>,
    dry_run: bool,
) -> Result<RunExit> {
    let dir = session_dir(explicit, &config.output_dir)?;
    let mut session = RunSession::load(&dir)?;
    if session.validation_mode != config.validation {
        tracing::warn!(
            session = %session.validation_mode,
            requested = %config.validation,
            "keeping the session's validation mode on resume"
        );
    }

    let mut scope = catalog.select_ids(&session.benchmark_ids);
    if let Some(selection) = selection {
        let explicit: Vec<&str> = catalog
            .select(selection)?
            .iter()
            .map(|benchmark| benchmark.id.as_str())
            .collect();
        scope.retain(|benchmark| explicit.contains(&benchmark.id.as_str()));
    }
    let plan: Vec<&BenchmarkDefinition> = session.selectable_for_resume(&scope);
    println!(
        "Resuming {}: {} of {} benchmarks remaining",
        session.session_id,
        plan.len(),
        scope.len()
    );
    if dry_run {
        print_plan(&plan, Some(&session), session.validation_mode, session.timeout_seconds);
        return Ok(RunExit::Completed);
    }
    if plan.is_empty() {
        return Ok(RunExit::Completed);
    }
    session.status = SessionStatus::Running;
    execute(&session_config(config, &session), session, &plan)
}

/// The run config with the agent budget pinned to the session's timeout.
fn session_config(config: &RunConfig, session: &RunSession) -> RunConfig {
    let timeout = Duration::from_secs(session.timeout_seconds);
    if timeout != config.timeout {
        tracing::warn!(
            session_s = session.timeout_seconds,
            requested_s = config.timeout.as_secs(),
            "keeping the session's timeout on resume"
        );
    }
    let mut config = config.clone();
    config.timeout = timeout;
    config.agent.timeout = timeout;
    config
}

fn execute(
    config: &RunConfig,
    mut session: RunSession,
    plan: &[&BenchmarkDefinition],
) -> Result<RunExit> {
    let docker = config.docker_path()?;
    let cancel = CancelToken::new();
    cancel::install_handler(cancel.clone())?;

    let reporter = Reporter::new(&session.output_dir)?;
    session
        .save()
        .with_context(|| format!("initialize session {}", session.output_dir.display()))?;
    let engine = ComposeEngine::new(docker, config.lifecycle.clone());
    let agent = AgentExecutor::new(config.agent.clone());
    let ctx = RunContext {
        engine: &engine,
        agent: &agent,
        cancel: &cancel,
        reporter: &reporter,
        target_host: &config.target_host,
    };

    let outcome = run_batch(&ctx, &mut session, plan)?;
    print_totals(&RunSummary::new(&session, Utc::now()));
    println!("Results: {}", session.output_dir.display());
    match outcome {
        BatchOutcome::Completed => Ok(RunExit::Completed),
        BatchOutcome::Cancelled => {
            eprintln!("Interrupted; state saved.");
            eprintln!("Resume with: xbench --resume {}", session.output_dir.display());
            Ok(RunExit::Cancelled)
        }
    }
}
