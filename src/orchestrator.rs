//! Trial state machine and the batch loop.
//!
//! A trial walks `Pending -> Building -> Starting -> DiscoveringPort ->
//! Executing -> Parsing -> TornDown -> Recorded`. Any infrastructure failure
//! jumps straight to `TornDown` with an `ERROR` outcome. The environment guard
//! is acquired before the build, so teardown is reached on every path,
//! including cancellation. One trial's failure never stops the batch.
use crate::agent::{AgentExecutor, AgentRun};
use crate::cancel::CancelToken;
use crate::catalog::BenchmarkDefinition;
use crate::config::target_url;
use crate::container::{ContainerEngine, EnvironmentGuard, Stage};
use crate::error::TrialError;
use crate::report::Reporter;
use crate::state::{ExecutionResult, RunSession, SessionStatus, Termination, TrialOutcome};
use crate::validation::{self, ValidationMode};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    Pending,
    Building,
    Starting,
    DiscoveringPort,
    Executing,
    Parsing,
    TornDown,
    Recorded,
}

/// Everything a trial needs, passed explicitly instead of held globally.
pub struct RunContext<'a> {
    pub engine: &'a dyn ContainerEngine,
    pub agent: &'a AgentExecutor,
    pub cancel: &'a CancelToken,
    pub reporter: &'a Reporter,
    pub target_host: &'a str,
}

#[derive(Debug)]
pub enum TrialReport {
    Finished(Box<ExecutionResult>),
    /// Interrupted and torn down; deliberately not recorded.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Cancelled,
}

struct PhaseTracker<'a> {
    benchmark: &'a str,
    phase: TrialPhase,
    history: Vec<TrialPhase>,
}

impl<'a> PhaseTracker<'a> {
    fn new(benchmark: &'a str) -> Self {
        Self {
            benchmark,
            phase: TrialPhase::Pending,
            history: vec![TrialPhase::Pending],
        }
    }

    fn advance(&mut self, next: TrialPhase) {
        tracing::debug!(benchmark = self.benchmark, from = ?self.phase, to = ?next, "trial phase");
        self.phase = next;
        self.history.push(next);
    }

    /// Enter `next` unless cancellation was requested while in `stage`.
    fn enter(
        &mut self,
        next: TrialPhase,
        stage: Stage,
        cancel: &CancelToken,
    ) -> Result<(), TrialError> {
        if cancel.is_cancelled() {
            return Err(TrialError::Cancelled(stage));
        }
        self.advance(next);
        Ok(())
    }
}

/// Fixed per-trial facts shared by every result shape.
struct TrialFrame<'a> {
    benchmark: &'a BenchmarkDefinition,
    started_at: DateTime<Utc>,
    clock: Instant,
    log_path: PathBuf,
}

impl TrialFrame<'_> {
    fn result(&self, outcome: TrialOutcome, warnings: Vec<String>) -> ExecutionResult {
        ExecutionResult {
            benchmark_id: self.benchmark.id.clone(),
            benchmark_name: self.benchmark.name.clone(),
            level: self.benchmark.level,
            tags: self.benchmark.tags.clone(),
            outcome,
            stage: None,
            termination: None,
            duration_seconds: self.clock.elapsed().as_secs_f64(),
            agent_seconds: None,
            cost_usd: None,
            expected_flag: self.benchmark.expected_flag.clone(),
            found_flags: Vec::new(),
            reported_flags: None,
            agent_session_id: None,
            error_message: None,
            agent_errors: Vec::new(),
            warnings,
            log_path: self.log_path.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Run one benchmark through the full state machine.
pub fn run_trial(
    ctx: &RunContext<'_>,
    benchmark: &BenchmarkDefinition,
    mode: ValidationMode,
) -> TrialReport {
    let frame = TrialFrame {
        benchmark,
        started_at: Utc::now(),
        clock: Instant::now(),
        log_path: ctx.reporter.trial_log_path(&benchmark.id),
    };
    let mut log: Box<dyn Write> = match ctx.reporter.open_trial_log(benchmark) {
        Ok(file) => Box::new(file),
        Err(err) => {
            tracing::warn!(benchmark = %benchmark.id, "trial log unavailable: {err:#}");
            Box::new(std::io::sink())
        }
    };
    let mut phases = PhaseTracker::new(&benchmark.id);

    let guard = EnvironmentGuard::acquire(ctx.engine, benchmark);
    let attempt = bring_up_and_execute(ctx, benchmark, &mut phases, log.as_mut());
    if let Ok(run) = &attempt {
        let status = run
            .status
            .map(|status| status.to_string())
            .unwrap_or_else(|| "unknown status".to_string());
        let _ = writeln!(log, "[xbench] agent stopped ({:?}): {status}", run.termination);
    }
    let parsed = match &attempt {
        Ok(run) if run.termination != Termination::Cancelled => {
            phases.advance(TrialPhase::Parsing);
            Some(validation::parse_output(&run.output))
        }
        _ => None,
    };
    phases.advance(TrialPhase::TornDown);
    let warnings = guard.release();
    for warning in &warnings {
        let _ = writeln!(log, "[xbench] warning: {warning}");
    }

    let result = match (attempt, parsed) {
        (Err(TrialError::Cancelled(stage)), _) => {
            tracing::info!(benchmark = %benchmark.id, %stage, "trial cancelled");
            let _ = writeln!(log, "[xbench] cancelled during {stage}");
            return TrialReport::Cancelled;
        }
        (Ok(run), None) => {
            tracing::info!(benchmark = %benchmark.id, elapsed_ms = run.elapsed.as_millis(), "agent cancelled");
            let _ = writeln!(log, "[xbench] cancelled during {}", Stage::Execute);
            return TrialReport::Cancelled;
        }
        (Err(err), _) => {
            let stage = err.stage();
            tracing::warn!(benchmark = %benchmark.id, %stage, "trial error: {err}");
            let _ = writeln!(log, "[xbench] {err}");
            ExecutionResult {
                stage: Some(stage),
                error_message: Some(err.to_string()),
                ..frame.result(TrialOutcome::Error, warnings)
            }
        }
        (Ok(run), Some(parsed)) => judge(&frame, &run, parsed, mode, warnings),
    };
    phases.advance(TrialPhase::Recorded);
    tracing::info!(
        benchmark = %result.benchmark_id,
        outcome = %result.outcome,
        duration_ms = (result.duration_seconds * 1000.0) as u64,
        phases = ?phases.history,
        "trial finished"
    );
    TrialReport::Finished(Box::new(result))
}

fn bring_up_and_execute(
    ctx: &RunContext<'_>,
    benchmark: &BenchmarkDefinition,
    phases: &mut PhaseTracker<'_>,
    log: &mut dyn Write,
) -> Result<AgentRun, TrialError> {
    phases.enter(TrialPhase::Building, Stage::Build, ctx.cancel)?;
    let _ = writeln!(log, "[xbench] building environment");
    ctx.engine.build(benchmark, ctx.cancel)?;

    phases.enter(TrialPhase::Starting, Stage::Start, ctx.cancel)?;
    let _ = writeln!(log, "[xbench] starting environment");
    ctx.engine.start(benchmark, ctx.cancel)?;

    phases.enter(TrialPhase::DiscoveringPort, Stage::DiscoverPort, ctx.cancel)?;
    let port = ctx.engine.discover_port(benchmark, ctx.cancel)?;

    phases.enter(TrialPhase::Executing, Stage::Execute, ctx.cancel)?;
    let target = target_url(ctx.target_host, port);
    let _ = writeln!(log, "[xbench] agent target {target}");
    let _ = log.flush();
    ctx.agent.run(&target, log, ctx.cancel)
}

/// Outcome precedence: TIMEOUT > SUCCESS > FAILURE (errors never get here).
fn judge(
    frame: &TrialFrame<'_>,
    run: &AgentRun,
    parsed: validation::ParsedOutput,
    mode: ValidationMode,
    warnings: Vec<String>,
) -> ExecutionResult {
    let expected = &frame.benchmark.expected_flag;
    let outcome = if run.termination == Termination::Timeout {
        TrialOutcome::Timeout
    } else if validation::passes(mode, &parsed.flags, expected) {
        TrialOutcome::Success
    } else {
        TrialOutcome::Failure
    };
    ExecutionResult {
        termination: Some(run.termination),
        agent_seconds: Some(run.elapsed.as_secs_f64()),
        cost_usd: parsed.cost_usd(),
        agent_session_id: parsed.session_id().map(str::to_string),
        reported_flags: parsed.done.as_ref().map(|done| done.flags_count),
        found_flags: parsed.flags,
        agent_errors: parsed.errors,
        ..frame.result(outcome, warnings)
    }
}

/// Run `plan` in order, recording after every trial.
///
/// Returns `Cancelled` when an interrupt stopped the batch; the session is
/// persisted and summarized either way.
pub fn run_batch(
    ctx: &RunContext<'_>,
    session: &mut RunSession,
    plan: &[&BenchmarkDefinition],
) -> Result<BatchOutcome> {
    let started = Instant::now();
    ctx.reporter.batch_started(session, plan.len());
    let total = plan.len();
    let mut outcome = BatchOutcome::Completed;

    for (index, benchmark) in plan.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            outcome = BatchOutcome::Cancelled;
            break;
        }
        ctx.reporter.trial_started(index + 1, total, benchmark);
        match run_trial(ctx, benchmark, session.validation_mode) {
            TrialReport::Finished(result) => {
                ctx.reporter.trial_finished(&result);
                session.record(*result)?;
            }
            TrialReport::Cancelled => {
                ctx.reporter.trial_cancelled(benchmark);
                outcome = BatchOutcome::Cancelled;
                break;
            }
        }
    }

    let status = match outcome {
        BatchOutcome::Completed => SessionStatus::Completed,
        BatchOutcome::Cancelled => SessionStatus::Cancelled,
    };
    session.set_status(status)?;
    ctx.reporter.write_summaries(session)?;
    tracing::info!(
        session = %session.session_id,
        elapsed_ms = started.elapsed().as_millis(),
        recorded = session.results.len(),
        ?outcome,
        "batch finished"
    );
    Ok(outcome)
}

/// Print what a run would do without touching containers or the agent.
pub fn print_plan(
    plan: &[&BenchmarkDefinition],
    prior: Option<&RunSession>,
    mode: ValidationMode,
    timeout_seconds: u64,
) {
    println!(
        "Dry run: {} benchmark(s) would run (validation {mode}, timeout {timeout_seconds}s)",
        plan.len()
    );
    for benchmark in plan {
        let tags = if benchmark.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", benchmark.tags.join(", "))
        };
        println!(
            "  {:<14} level {}  {}{tags}",
            benchmark.id, benchmark.level, benchmark.name
        );
        if let Some(previous) = prior.and_then(|session| session.results.get(&benchmark.id)) {
            println!(
                "  {:<14} previous: {} ({})",
                "",
                previous.outcome,
                previous.failure_reason()
            );
        }
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
