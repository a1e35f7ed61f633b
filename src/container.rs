//! Per-trial isolated environments driven through `docker compose`.
//!
//! Each benchmark gets its own compose project so leftovers from one trial
//! never collide with the next. `EnvironmentGuard` owns the release side:
//! once created, teardown runs exactly once, on the normal path or on drop.
use crate::cancel::CancelToken;
use crate::catalog::BenchmarkDefinition;
use crate::error::TrialError;
use crate::process::{run_bounded, BoundedOutput};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Trial stage reported with infrastructure errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Build,
    Start,
    DiscoverPort,
    Execute,
    Teardown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Stage::Build => "BUILD",
            Stage::Start => "START",
            Stage::DiscoverPort => "DISCOVER_PORT",
            Stage::Execute => "EXECUTE",
            Stage::Teardown => "TEARDOWN",
        };
        f.write_str(label)
    }
}

/// Bounds for every lifecycle step.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    pub build_timeout: Duration,
    pub start_timeout: Duration,
    pub teardown_timeout: Duration,
    pub health_attempts: u32,
    pub health_interval: Duration,
    pub port_attempts: u32,
    pub port_backoff: Duration,
    pub port_backoff_max: Duration,
    pub terminate_grace: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            build_timeout: Duration::from_secs(300),
            start_timeout: Duration::from_secs(120),
            teardown_timeout: Duration::from_secs(60),
            health_attempts: 30,
            health_interval: Duration::from_secs(2),
            port_attempts: 5,
            port_backoff: Duration::from_secs(1),
            port_backoff_max: Duration::from_secs(8),
            terminate_grace: Duration::from_secs(10),
        }
    }
}

/// Delay before port-discovery retry `attempt` (0-based), doubling up to `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// The external engine that builds, runs and removes benchmark environments.
///
/// `teardown` is never bounded by cancellation: it is the release half of the
/// contract and must run even while the process is shutting down.
pub trait ContainerEngine {
    fn build(&self, benchmark: &BenchmarkDefinition, cancel: &CancelToken)
        -> Result<(), TrialError>;
    fn start(&self, benchmark: &BenchmarkDefinition, cancel: &CancelToken)
        -> Result<(), TrialError>;
    /// Host port published for the benchmark's declared internal port.
    fn discover_port(
        &self,
        benchmark: &BenchmarkDefinition,
        cancel: &CancelToken,
    ) -> Result<u16, TrialError>;
    fn teardown(&self, benchmark: &BenchmarkDefinition) -> Result<(), String>;
}

/// Scoped ownership of one trial's environment.
pub struct EnvironmentGuard<'a> {
    engine: &'a dyn ContainerEngine,
    benchmark: &'a BenchmarkDefinition,
    released: bool,
}

impl<'a> EnvironmentGuard<'a> {
    /// Take ownership before `build`, so a failing build is still torn down.
    pub fn acquire(engine: &'a dyn ContainerEngine, benchmark: &'a BenchmarkDefinition) -> Self {
        Self {
            engine,
            benchmark,
            released: false,
        }
    }

    /// Tear down now. Failures come back as warnings for the result.
    pub fn release(mut self) -> Vec<String> {
        self.released = true;
        teardown_with_warning(self.engine, self.benchmark)
            .into_iter()
            .collect()
    }
}

impl Drop for EnvironmentGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let _ = teardown_with_warning(self.engine, self.benchmark);
        }
    }
}

fn teardown_with_warning(
    engine: &dyn ContainerEngine,
    benchmark: &BenchmarkDefinition,
) -> Option<String> {
    let start = Instant::now();
    let result = engine.teardown(benchmark);
    let elapsed_ms = start.elapsed().as_millis();
    match result {
        Ok(()) => {
            tracing::info!(benchmark = %benchmark.id, elapsed_ms, "environment torn down");
            None
        }
        Err(message) => {
            tracing::warn!(benchmark = %benchmark.id, elapsed_ms, "teardown failed: {message}");
            Some(format!("teardown failed: {message}"))
        }
    }
}

/// `docker compose` implementation of `ContainerEngine`.
#[derive(Debug, Clone)]
pub struct ComposeEngine {
    docker: PathBuf,
    settings: LifecycleSettings,
}

impl ComposeEngine {
    pub fn new(docker: PathBuf, settings: LifecycleSettings) -> Self {
        Self { docker, settings }
    }

    fn compose(&self, benchmark: &BenchmarkDefinition) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.arg("compose")
            .arg("-f")
            .arg(&benchmark.compose_file)
            .arg("-p")
            .arg(project_name(&benchmark.id))
            .current_dir(&benchmark.root)
            .env("FLAG", &benchmark.expected_flag);
        cmd
    }

    fn run(
        &self,
        stage: Stage,
        mut cmd: Command,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<BoundedOutput, TrialError> {
        let start = Instant::now();
        let output = run_bounded(&mut cmd, timeout, cancel, self.settings.terminate_grace)
            .map_err(|err| {
                TrialError::environment(stage, format!("run {}: {err}", self.docker.display()))
            })?;
        tracing::debug!(
            %stage,
            elapsed_ms = start.elapsed().as_millis(),
            success = output.success(),
            "compose command finished"
        );
        if output.cancelled {
            return Err(TrialError::Cancelled(stage));
        }
        if !output.success() {
            return Err(TrialError::environment(stage, output.diagnostic()));
        }
        Ok(output)
    }

    fn service_status(
        &self,
        benchmark: &BenchmarkDefinition,
        cancel: &CancelToken,
    ) -> Result<String, TrialError> {
        let mut cmd = self.compose(benchmark);
        cmd.args(["ps", "--all", "--format", "{{.Status}}"]);
        let output = self.run(Stage::Start, cmd, self.settings.start_timeout, Some(cancel))?;
        Ok(output.stdout)
    }
}

impl ContainerEngine for ComposeEngine {
    fn build(
        &self,
        benchmark: &BenchmarkDefinition,
        cancel: &CancelToken,
    ) -> Result<(), TrialError> {
        let mut cmd = self.compose(benchmark);
        cmd.arg("build");
        self.run(Stage::Build, cmd, self.settings.build_timeout, Some(cancel))?;
        Ok(())
    }

    fn start(
        &self,
        benchmark: &BenchmarkDefinition,
        cancel: &CancelToken,
    ) -> Result<(), TrialError> {
        let mut cmd = self.compose(benchmark);
        cmd.args(["up", "-d"]);
        self.run(Stage::Start, cmd, self.settings.start_timeout, Some(cancel))?;

        let mut last = String::new();
        for attempt in 1..=self.settings.health_attempts {
            last = self.service_status(benchmark, cancel)?;
            match health_of(&last) {
                Health::Ready => {
                    tracing::info!(benchmark = %benchmark.id, attempt, "environment healthy");
                    return Ok(());
                }
                Health::Failed => {
                    return Err(TrialError::environment(
                        Stage::Start,
                        format!("service exited: {}", last.trim()),
                    ));
                }
                Health::Pending => {}
            }
            if !cancel.sleep(self.settings.health_interval) {
                return Err(TrialError::Cancelled(Stage::Start));
            }
        }
        Err(TrialError::environment(
            Stage::Start,
            format!(
                "not healthy after {} checks (last status: {})",
                self.settings.health_attempts,
                last.trim().replace('\n', "; ")
            ),
        ))
    }

    fn discover_port(
        &self,
        benchmark: &BenchmarkDefinition,
        cancel: &CancelToken,
    ) -> Result<u16, TrialError> {
        let mut last = String::new();
        for attempt in 0..self.settings.port_attempts {
            let mut cmd = self.compose(benchmark);
            cmd.args(["ps", "--format", "{{.Ports}}"]);
            let output =
                self.run(Stage::DiscoverPort, cmd, self.settings.start_timeout, Some(cancel))?;
            if let Some(port) = parse_published_port(&output.stdout, benchmark.port) {
                tracing::info!(benchmark = %benchmark.id, port, attempt, "port discovered");
                return Ok(port);
            }
            last = output.stdout;
            let delay = backoff_delay(
                self.settings.port_backoff,
                self.settings.port_backoff_max,
                attempt,
            );
            tracing::debug!(benchmark = %benchmark.id, attempt, ?delay, "port not visible yet");
            if attempt + 1 < self.settings.port_attempts && !cancel.sleep(delay) {
                return Err(TrialError::Cancelled(Stage::DiscoverPort));
            }
        }
        let wanted = benchmark
            .port
            .map(|port| format!("container port {port}"))
            .unwrap_or_else(|| "any port".to_string());
        Err(TrialError::environment(
            Stage::DiscoverPort,
            format!(
                "no published mapping for {wanted} after {} attempts (ports: {:?})",
                self.settings.port_attempts,
                last.trim()
            ),
        ))
    }

    fn teardown(&self, benchmark: &BenchmarkDefinition) -> Result<(), String> {
        let mut cmd = self.compose(benchmark);
        cmd.args(["down", "--remove-orphans"]);
        self.run(Stage::Teardown, cmd, self.settings.teardown_timeout, None)
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

/// Compose project names must be lowercase alphanumerics, `-` or `_`.
pub fn project_name(id: &str) -> String {
    let name: String = id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("xbench_{name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Ready,
    Pending,
    Failed,
}

fn health_of(status: &str) -> Health {
    let lines: Vec<&str> = status
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        return Health::Pending;
    }
    let failed = |line: &&str| {
        line.contains("unhealthy") || line.starts_with("Exited (1") || line.starts_with("Dead")
    };
    if lines.iter().any(failed) {
        return Health::Failed;
    }
    let running = lines.iter().filter(|line| line.starts_with("Up")).count();
    let settling = lines.iter().any(|line| {
        line.contains("health: starting")
            || line.starts_with("Restarting")
            || line.starts_with("Created")
    });
    if running > 0 && !settling {
        Health::Ready
    } else {
        Health::Pending
    }
}

fn port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:0\.0\.0\.0|\[::\]|::|127\.0\.0\.1):(\d+)->(\d+)/(?:tcp|udp)")
            .expect("port mapping regex")
    })
}

/// Host port from `docker compose ps --format {{.Ports}}` output.
///
/// With a declared `internal` port only its mapping counts; `None` means it
/// is not published yet. Without one, the first mapping is taken.
pub fn parse_published_port(ports: &str, internal: Option<u16>) -> Option<u16> {
    let mut mappings = port_regex()
        .captures_iter(ports)
        .filter_map(|caps| Some((caps[1].parse::<u16>().ok()?, caps[2].parse::<u16>().ok()?)));
    match internal {
        Some(internal) => mappings
            .find(|(_, container)| *container == internal)
            .map(|(host, _)| host),
        None => mappings.next().map(|(host, _)| host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn prefers_declared_internal_port() {
        let ports = "0.0.0.0:49153->22/tcp, 0.0.0.0:49154->80/tcp, [::]:49154->80/tcp\n";
        assert_eq!(parse_published_port(ports, Some(80)), Some(49154));
        assert_eq!(parse_published_port(ports, Some(8080)), None);
        assert_eq!(parse_published_port("0.0.0.0:49153->22/tcp\n", Some(80)), None);
        assert_eq!(parse_published_port(ports, None), Some(49153));
        assert_eq!(parse_published_port("5432/tcp\n", Some(5432)), None);
        assert_eq!(parse_published_port("", None), None);
    }

    #[test]
    fn classifies_compose_status_lines() {
        assert_eq!(health_of(""), Health::Pending);
        assert_eq!(health_of("Up 3 seconds (health: starting)\n"), Health::Pending);
        assert_eq!(health_of("Up 10 seconds (healthy)\nUp 9 seconds\n"), Health::Ready);
        assert_eq!(health_of("Up 4 seconds (unhealthy)\n"), Health::Failed);
        assert_eq!(health_of("Exited (1) 2 seconds ago\n"), Health::Failed);
        assert_eq!(health_of("Exited (0) 1 second ago\nUp 5 seconds\n"), Health::Ready);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(8);
        let delays: Vec<u64> = (0..6)
            .map(|attempt| backoff_delay(base, max, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
        assert_eq!(backoff_delay(base, max, 40), max);
    }

    #[test]
    fn project_names_are_compose_safe() {
        assert_eq!(project_name("XBEN-001-24"), "xbench_xben-001-24");
        assert_eq!(project_name("web.app 2"), "xbench_web_app_2");
    }

    struct CountingEngine {
        teardowns: RefCell<u32>,
        fail_teardown: bool,
    }

    impl ContainerEngine for CountingEngine {
        fn build(&self, _: &BenchmarkDefinition, _: &CancelToken) -> Result<(), TrialError> {
            Ok(())
        }
        fn start(&self, _: &BenchmarkDefinition, _: &CancelToken) -> Result<(), TrialError> {
            Ok(())
        }
        fn discover_port(&self, _: &BenchmarkDefinition, _: &CancelToken) -> Result<u16, TrialError> {
            Ok(8080)
        }
        fn teardown(&self, _: &BenchmarkDefinition) -> Result<(), String> {
            *self.teardowns.borrow_mut() += 1;
            if self.fail_teardown {
                Err("network still in use".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn benchmark() -> BenchmarkDefinition {
        BenchmarkDefinition {
            id: "XBEN-001-24".to_string(),
            key: 1,
            name: "demo".to_string(),
            description: String::new(),
            level: 1,
            tags: Vec::new(),
            port: Some(80),
            flag_format: None,
            expected_flag: "FLAG{x}".to_string(),
            root: PathBuf::from("/tmp"),
            compose_file: PathBuf::from("/tmp/docker-compose.yml"),
        }
    }

    #[test]
    fn guard_tears_down_once_on_release_or_drop() {
        let engine = CountingEngine {
            teardowns: RefCell::new(0),
            fail_teardown: false,
        };
        let definition = benchmark();
        {
            let _guard = EnvironmentGuard::acquire(&engine, &definition);
        }
        assert_eq!(*engine.teardowns.borrow(), 1);

        let guard = EnvironmentGuard::acquire(&engine, &definition);
        assert!(guard.release().is_empty());
        assert_eq!(*engine.teardowns.borrow(), 2);
    }

    #[test]
    fn teardown_failure_becomes_a_warning() {
        let engine = CountingEngine {
            teardowns: RefCell::new(0),
            fail_teardown: true,
        };
        let definition = benchmark();
        let warnings = EnvironmentGuard::acquire(&engine, &definition).release();
        assert_eq!(warnings, vec!["teardown failed: network still in use".to_string()]);
    }
}
