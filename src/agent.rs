//! Runs the agent-under-test against a discovered target.
//!
//! The agent is an opaque subprocess. Its stdout and stderr are streamed line
//! by line into the trial log and an in-memory transcript; the first line
//! carrying the completion marker ends the run early.
use crate::cancel::CancelToken;
use crate::error::TrialError;
use crate::process::{
    drain_lines, line_channel, spawn_grouped, terminate, OutputLine, POLL_INTERVAL,
};
use crate::state::Termination;
use crate::validation::is_done_marker;
use std::io::Write;
use std::process::{Command, ExitStatus};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    /// Program followed by its fixed leading arguments.
    pub command: Vec<String>,
    /// Full model identifier forwarded as `--model <id>`.
    pub model: Option<String>,
    pub timeout: Duration,
    pub terminate_grace: Duration,
}

/// Captured transcript plus how the process ended.
#[derive(Debug)]
pub struct AgentRun {
    pub output: String,
    pub termination: Termination,
    /// Time until the marker, the deadline, cancellation, or exit.
    pub elapsed: Duration,
    pub status: Option<ExitStatus>,
}

#[derive(Debug, Clone)]
pub struct AgentExecutor {
    settings: AgentSettings,
}

impl AgentExecutor {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }

    /// Argument vector after the program: fixed words, model, target.
    pub fn args_for(&self, target: &str) -> Vec<String> {
        let mut args: Vec<String> = self.settings.command.iter().skip(1).cloned().collect();
        if let Some(model) = &self.settings.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push(target.to_string());
        args
    }

    /// Run the agent until marker, deadline, cancellation, or exit.
    ///
    /// Errors only when the agent cannot be launched. A non-zero exit is a
    /// normal run whose transcript is judged like any other.
    pub fn run(
        &self,
        target: &str,
        log: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<AgentRun, TrialError> {
        let program = self
            .settings
            .command
            .first()
            .ok_or_else(|| TrialError::Execution("agent command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(self.args_for(target));
        let mut child = spawn_grouped(&mut cmd)
            .map_err(|err| TrialError::Execution(format!("spawn {program}: {err}")))?;
        tracing::info!(pid = child.id(), target, "agent started");

        let rx = line_channel(&mut child);
        let started = Instant::now();
        let deadline = started + self.settings.timeout;
        let mut transcript = Transcript::new(log);

        let termination = loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    let done = is_done_marker(&line.text);
                    transcript.push(line);
                    if done {
                        break Termination::Marker;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if let Ok(Some(_)) = child.try_wait() {
                        break Termination::NaturalExit;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            if cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            if Instant::now() >= deadline {
                break Termination::Timeout;
            }
            if let Ok(Some(_)) = child.try_wait() {
                break Termination::NaturalExit;
            }
        };
        let elapsed = started.elapsed();

        let status = terminate(&mut child, self.settings.terminate_grace);
        drain_lines(&rx, |line| transcript.push(line));
        tracing::info!(
            ?termination,
            elapsed_ms = elapsed.as_millis(),
            output_bytes = transcript.text.len(),
            "agent finished"
        );
        Ok(AgentRun {
            output: transcript.text,
            termination,
            elapsed,
            status,
        })
    }
}

struct Transcript<'a> {
    text: String,
    log: &'a mut dyn Write,
    log_failed: bool,
}

impl<'a> Transcript<'a> {
    fn new(log: &'a mut dyn Write) -> Self {
        Self {
            text: String::new(),
            log,
            log_failed: false,
        }
    }

    fn push(&mut self, line: OutputLine) {
        self.text.push_str(&line.text);
        self.text.push('\n');
        if self.log_failed {
            return;
        }
        if let Err(err) = writeln!(self.log, "{}", line.text).and_then(|()| self.log.flush()) {
            tracing::warn!(error = %err, "trial log write failed; continuing without it");
            self.log_failed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(script: &str, timeout: Duration) -> AgentExecutor {
        AgentExecutor::new(AgentSettings {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "agent".to_string(),
            ],
            model: None,
            timeout,
            terminate_grace: Duration::from_millis(500),
        })
    }

    #[test]
    fn args_place_model_before_target() {
        let agent = AgentExecutor::new(AgentSettings {
            command: vec!["pentestgpt".into(), "--non-interactive".into(), "--target".into()],
            model: Some("claude-sonnet-4-5".into()),
            timeout: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(1),
        });
        assert_eq!(
            agent.args_for("http://host.docker.internal:8080"),
            vec![
                "--non-interactive",
                "--target",
                "--model",
                "claude-sonnet-4-5",
                "http://host.docker.internal:8080"
            ]
        );
    }

    #[test]
    fn marker_ends_run_before_deadline() {
        let agent = executor(
            "echo \"probing $1\"; echo 'FLAG{found}'; echo '[DONE] Flags: 1, Cost: $0.10, Session: s1'; sleep 30",
            Duration::from_secs(20),
        );
        let mut log = Vec::new();
        let run = agent.run("http://t:1", &mut log, &CancelToken::new()).unwrap();
        assert_eq!(run.termination, Termination::Marker);
        assert!(run.elapsed < Duration::from_secs(5), "elapsed {:?}", run.elapsed);
        assert!(run.output.contains("probing http://t:1"));
        assert!(run.output.contains("FLAG{found}"));
        assert!(String::from_utf8(log).unwrap().contains("[DONE]"));
    }

    #[test]
    fn silent_agent_hits_deadline_and_is_killed() {
        let agent = executor("trap '' TERM; echo started; sleep 30", Duration::from_millis(400));
        let started = Instant::now();
        let run = agent.run("http://t:1", &mut std::io::sink(), &CancelToken::new()).unwrap();
        assert_eq!(run.termination, Termination::Timeout);
        assert!(run.status.is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(run.output, "started\n");
    }

    #[test]
    fn natural_exit_keeps_full_output() {
        let agent = executor("echo one; echo two >&2; exit 3", Duration::from_secs(10));
        let run = agent.run("http://t:1", &mut std::io::sink(), &CancelToken::new()).unwrap();
        assert_eq!(run.termination, Termination::NaturalExit);
        assert!(run.output.contains("one\n"));
        assert!(run.output.contains("two\n"));
        assert_eq!(run.status.and_then(|status| status.code()), Some(3));
    }

    #[test]
    fn cancellation_is_reported() {
        let agent = executor("sleep 30", Duration::from_secs(30));
        let cancel = CancelToken::new();
        cancel.cancel();
        let run = agent.run("http://t:1", &mut std::io::sink(), &cancel).unwrap();
        assert_eq!(run.termination, Termination::Cancelled);
    }

    #[test]
    fn missing_program_is_an_execution_error() {
        let agent = AgentExecutor::new(AgentSettings {
            command: vec!["/nonexistent/agent-binary".to_string()],
            model: None,
            timeout: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(1),
        });
        let err = agent
            .run("http://t:1", &mut std::io::sink(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, TrialError::Execution(_)));
    }
}
