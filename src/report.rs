//! Operator-facing progress output and end-of-run summaries.
use crate::catalog::BenchmarkDefinition;
use crate::state::{ExecutionResult, RunSession, TrialOutcome};
use crate::util::{append_line, atomic_write, atomic_write_json, format_duration};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

pub const SUMMARY_JSON: &str = "summary.json";
pub const SUMMARY_TEXT: &str = "summary.txt";
pub const DETAILED_LOG: &str = "detailed.log";
pub const TRIAL_LOG_DIR: &str = "benchmarks";

pub fn glyph(result: &ExecutionResult) -> &'static str {
    match result.outcome {
        TrialOutcome::Success => "✓",
        TrialOutcome::Failure => "✗",
        TrialOutcome::Timeout => "⏱",
        TrialOutcome::Error => "!",
    }
}

/// Nearest-rank percentile of `values`; `None` when empty.
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Totals {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub timeout: usize,
    pub error: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Distribution {
    pub samples: usize,
    pub total: f64,
    pub average: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
}

impl Distribution {
    fn of(values: &[f64]) -> Self {
        let total: f64 = values.iter().sum();
        Self {
            samples: values.len(),
            total,
            average: (!values.is_empty()).then(|| total / values.len() as f64),
            p50: percentile(values, 50.0),
            p90: percentile(values, 90.0),
        }
    }
}

/// Machine-readable run summary written to `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary<'a> {
    pub session_id: &'a str,
    pub validation_mode: String,
    pub timeout_seconds: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: Totals,
    pub duration_seconds: Distribution,
    pub cost_usd: Distribution,
    pub results: Vec<&'a ExecutionResult>,
}

impl<'a> RunSummary<'a> {
    pub fn new(session: &'a RunSession, finished_at: DateTime<Utc>) -> Self {
        let results = session.ordered_results();
        let count = |outcome| results.iter().filter(|r| r.outcome == outcome).count();
        let success = count(TrialOutcome::Success);
        let totals = Totals {
            total: results.len(),
            success,
            failure: count(TrialOutcome::Failure),
            timeout: count(TrialOutcome::Timeout),
            error: count(TrialOutcome::Error),
            success_rate: if results.is_empty() {
                0.0
            } else {
                success as f64 * 100.0 / results.len() as f64
            },
        };
        let durations: Vec<f64> = results.iter().map(|r| r.duration_seconds).collect();
        let costs: Vec<f64> = results.iter().filter_map(|r| r.cost_usd).collect();
        Self {
            session_id: &session.session_id,
            validation_mode: session.validation_mode.to_string(),
            timeout_seconds: session.timeout_seconds,
            started_at: session.created_at,
            finished_at,
            totals,
            duration_seconds: Distribution::of(&durations),
            cost_usd: Distribution::of(&costs),
            results,
        }
    }
}

/// Writes console progress and the session's log and summary files.
#[derive(Debug, Clone)]
pub struct Reporter {
    session_dir: PathBuf,
}

impl Reporter {
    pub fn new(session_dir: &Path) -> Result<Self> {
        let logs = session_dir.join(TRIAL_LOG_DIR);
        fs::create_dir_all(&logs).with_context(|| format!("create {}", logs.display()))?;
        Ok(Self {
            session_dir: session_dir.to_path_buf(),
        })
    }

    pub fn trial_log_path(&self, benchmark_id: &str) -> PathBuf {
        self.session_dir
            .join(TRIAL_LOG_DIR)
            .join(format!("{benchmark_id}.log"))
    }

    /// Open a fresh per-trial log with a short header.
    pub fn open_trial_log(&self, benchmark: &BenchmarkDefinition) -> Result<fs::File> {
        let path = self.trial_log_path(&benchmark.id);
        let mut file =
            fs::File::create(&path).with_context(|| format!("create {}", path.display()))?;
        let header = format!(
            "# {} - {}\n# level {} tags [{}]\n# started {}\n",
            benchmark.id,
            benchmark.name,
            benchmark.level,
            benchmark.tags.join(", "),
            Utc::now().to_rfc3339()
        );
        std::io::Write::write_all(&mut file, header.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(file)
    }

    fn detail(&self, line: &str) {
        let path = self.session_dir.join(DETAILED_LOG);
        let stamped = format!("{} {line}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        if let Err(err) = append_line(&path, &stamped) {
            tracing::warn!(error = %err, "detailed log write failed");
        }
    }

    pub fn batch_started(&self, session: &RunSession, planned: usize) {
        println!(
            "Session {} ({} benchmarks, validation {}, timeout {}s)",
            session.session_id, planned, session.validation_mode, session.timeout_seconds
        );
        println!("Output: {}", self.session_dir.display());
        self.detail(&format!(
            "BATCH START session={} planned={planned} validation={}",
            session.session_id, session.validation_mode
        ));
    }

    pub fn trial_started(&self, index: usize, total: usize, benchmark: &BenchmarkDefinition) {
        println!(
            "[{index}/{total}] {} - {} (level {})",
            benchmark.id, benchmark.name, benchmark.level
        );
        self.detail(&format!("START {}", benchmark.id));
    }

    pub fn trial_finished(&self, result: &ExecutionResult) {
        let cost = result
            .cost_usd
            .map(|cost| format!(" ${cost:.4}"))
            .unwrap_or_default();
        let detail = match result.outcome {
            TrialOutcome::Success => String::new(),
            _ => format!(" ({})", result.failure_reason()),
        };
        println!(
            "  {} {} {}{cost}{detail}",
            glyph(result),
            result.outcome,
            format_duration(result.duration_seconds)
        );
        for warning in &result.warnings {
            println!("  warning: {warning}");
        }
        self.detail(&format!(
            "COMPLETE {} outcome={} duration={:.1}s{}",
            result.benchmark_id, result.outcome, result.duration_seconds, detail
        ));
    }

    pub fn trial_cancelled(&self, benchmark: &BenchmarkDefinition) {
        println!("  cancelled; {} will run again on resume", benchmark.id);
        self.detail(&format!("CANCELLED {}", benchmark.id));
    }

    /// Write `summary.json` and `summary.txt` for the session as it stands.
    pub fn write_summaries(&self, session: &RunSession) -> Result<()> {
        let summary = RunSummary::new(session, Utc::now());
        atomic_write_json(&self.session_dir.join(SUMMARY_JSON), &summary)?;
        let text_path = self.session_dir.join(SUMMARY_TEXT);
        atomic_write(&text_path, render_text(&summary).as_bytes())
            .with_context(|| format!("write {}", text_path.display()))?;
        self.detail(&format!(
            "BATCH END session={} success={}/{}",
            session.session_id, summary.totals.success, summary.totals.total
        ));
        Ok(())
    }
}

pub fn print_totals(summary: &RunSummary<'_>) {
    let t = &summary.totals;
    println!();
    println!(
        "Done: {} solved, {} failed, {} timed out, {} harness errors ({:.1}% of {})",
        t.success, t.failure, t.timeout, t.error, t.success_rate, t.total
    );
    if summary.cost_usd.samples > 0 {
        println!("Total cost: ${:.4}", summary.cost_usd.total);
    }
}

fn fmt_opt(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(value) => format!("{value:.2}{unit}"),
        None => "n/a".to_string(),
    }
}

/// Plain-text summary. Harness errors are listed apart from agent failures.
pub fn render_text(summary: &RunSummary<'_>) -> String {
    let mut out = String::new();
    let t = &summary.totals;
    let _ = writeln!(out, "Benchmark run {}", summary.session_id);
    let _ = writeln!(
        out,
        "Started {}  Finished {}",
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        summary.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(
        out,
        "Validation: {}  Timeout: {}s",
        summary.validation_mode, summary.timeout_seconds
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "Total:          {}", t.total);
    let _ = writeln!(out, "Success:        {} ({:.1}%)", t.success, t.success_rate);
    let _ = writeln!(out, "Failure:        {}", t.failure);
    let _ = writeln!(out, "Timeout:        {}", t.timeout);
    let _ = writeln!(out, "Harness errors: {}", t.error);
    let _ = writeln!(out);

    let d = &summary.duration_seconds;
    let c = &summary.cost_usd;
    let _ = writeln!(out, "Time: total {}", format_duration(d.total));
    let _ = writeln!(
        out,
        "  average {}  p50 {}  p90 {}",
        fmt_opt(d.average, "s"),
        fmt_opt(d.p50, "s"),
        fmt_opt(d.p90, "s")
    );
    let _ = writeln!(
        out,
        "Cost: total ${:.4} over {} trials with cost data",
        c.total, c.samples
    );
    let _ = writeln!(
        out,
        "  average {}  p50 {}  p90 {}",
        fmt_opt(c.average, " USD"),
        fmt_opt(c.p50, " USD"),
        fmt_opt(c.p90, " USD")
    );

    let sections: [(&str, &[TrialOutcome]); 3] = [
        ("Solved", &[TrialOutcome::Success]),
        ("Agent failures", &[TrialOutcome::Failure, TrialOutcome::Timeout]),
        ("Harness errors", &[TrialOutcome::Error]),
    ];
    for (title, outcomes) in sections {
        let rows: Vec<&&ExecutionResult> = summary
            .results
            .iter()
            .filter(|r| outcomes.contains(&r.outcome))
            .collect();
        if rows.is_empty() {
            continue;
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "{title}:");
        for result in rows {
            let cost = result
                .cost_usd
                .map(|cost| format!("${cost:.4}"))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "  {} {:<14} {:<8} {:>8} {:>10}  {}",
                glyph(result),
                result.benchmark_id,
                result.outcome.label(),
                format_duration(result.duration_seconds),
                cost,
                result.failure_reason()
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Stage;
    use crate::validation::ValidationMode;

    fn result(id: &str, outcome: TrialOutcome, duration: f64, cost: Option<f64>) -> ExecutionResult {
        ExecutionResult {
            benchmark_id: id.to_string(),
            benchmark_name: format!("{id} name"),
            level: 1,
            tags: Vec::new(),
            outcome,
            stage: (outcome == TrialOutcome::Error).then_some(Stage::Build),
            termination: None,
            duration_seconds: duration,
            agent_seconds: None,
            cost_usd: cost,
            expected_flag: "FLAG{x}".to_string(),
            found_flags: Vec::new(),
            reported_flags: None,
            agent_session_id: None,
            error_message: (outcome == TrialOutcome::Error).then(|| "exit 1: no space".to_string()),
            agent_errors: Vec::new(),
            warnings: Vec::new(),
            log_path: PathBuf::from(format!("benchmarks/{id}.log")),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn session(dir: &Path) -> RunSession {
        let mut session = RunSession::create(dir, Vec::new(), ValidationMode::Exact, 900);
        session.output_dir = dir.to_path_buf();
        for r in [
            result("XBEN-001-24", TrialOutcome::Success, 60.0, Some(1.0)),
            result("XBEN-002-24", TrialOutcome::Failure, 120.0, Some(3.0)),
            result("XBEN-003-24", TrialOutcome::Timeout, 900.0, None),
            result("XBEN-004-24", TrialOutcome::Error, 5.0, None),
        ] {
            session.record(r).unwrap();
        }
        session
    }

    #[test]
    fn nearest_rank_percentiles() {
        let values = [15.0, 20.0, 35.0, 40.0, 50.0];
        assert_eq!(percentile(&values, 50.0), Some(35.0));
        assert_eq!(percentile(&values, 90.0), Some(50.0));
        assert_eq!(percentile(&[7.0], 90.0), Some(7.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn summary_counts_every_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let summary = RunSummary::new(&session, Utc::now());
        assert_eq!(
            summary.totals,
            Totals {
                total: 4,
                success: 1,
                failure: 1,
                timeout: 1,
                error: 1,
                success_rate: 25.0,
            }
        );
        assert_eq!(summary.cost_usd.samples, 2);
        assert_eq!(summary.cost_usd.total, 4.0);
        assert_eq!(summary.cost_usd.average, Some(2.0));
        assert_eq!(summary.duration_seconds.p90, Some(900.0));
    }

    #[test]
    fn text_summary_separates_harness_errors() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let text = render_text(&RunSummary::new(&session, Utc::now()));
        let failures = text.find("Agent failures:").unwrap();
        let errors = text.find("Harness errors:\n").unwrap();
        assert!(failures < errors);
        assert!(text[errors..].contains("XBEN-004-24"));
        assert!(text[errors..].contains("[BUILD] exit 1: no space"));
        assert!(!text[errors..].contains("XBEN-002-24"));
        assert!(text[failures..errors].contains("timeout after 15m"));
    }

    #[test]
    fn writes_summary_files() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let reporter = Reporter::new(dir.path()).unwrap();
        reporter.write_summaries(&session).unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(SUMMARY_JSON)).unwrap()).unwrap();
        assert_eq!(json["totals"]["total"], 4);
        assert_eq!(json["results"][3]["outcome"], "ERROR");
        assert!(dir.path().join(SUMMARY_TEXT).is_file());
        assert!(dir.path().join(DETAILED_LOG).is_file());
    }
}
