//! Subprocess plumbing shared by the container engine and the agent executor.
//!
//! Children run in their own process group so a terminal interrupt reaches
//! only this process; termination is always SIGTERM to the group, a grace
//! period, then SIGKILL. Output is read by one thread per pipe and delivered
//! line by line over a bounded channel so callers can keep checking
//! deadlines instead of blocking on a read.
use crate::cancel::CancelToken;
use crate::util::truncate_string;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

const LINE_CHANNEL_CAPACITY: usize = 1024;
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_DIAGNOSTIC_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputLine {
    pub pipe: Pipe,
    pub text: String,
}

/// Spawn `cmd` in a fresh process group with piped stdout/stderr.
pub fn spawn_grouped(cmd: &mut Command) -> std::io::Result<Child> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
}

/// Take the child's pipes and stream their lines over a bounded channel.
///
/// The receiver disconnects once both pipes reach EOF.
pub fn line_channel(child: &mut Child) -> Receiver<OutputLine> {
    let (tx, rx) = mpsc::sync_channel(LINE_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, Pipe::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, Pipe::Stderr, tx);
    }
    rx
}

fn spawn_reader<R: Read + Send + 'static>(pipe: R, kind: Pipe, tx: SyncSender<OutputLine>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(OutputLine { pipe: kind, text }).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Terminate the child's process group: SIGTERM, wait `grace`, then SIGKILL.
///
/// The group is swept with SIGKILL even when the leader has already exited,
/// so background helpers it left behind do not survive the trial.
pub fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let status = match child.try_wait() {
        Ok(Some(status)) => Some(status),
        _ => stop_leader(child, grace),
    };
    signal_group(child, libc::SIGKILL);
    status
}

fn stop_leader(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    signal_group(child, libc::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(_) => break,
        }
    }
    tracing::warn!(pid = child.id(), "process ignored SIGTERM; killing");
    signal_group(child, libc::SIGKILL);
    let _ = child.kill();
    child.wait().ok()
}

fn signal_group(child: &Child, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the negative pid
    // addresses the group created by `spawn_grouped`, whose leader is the child.
    unsafe {
        libc::kill(-pgid, signal);
    }
}

/// Pull lines that are still buffered after the child exited.
pub fn drain_lines(rx: &Receiver<OutputLine>, mut sink: impl FnMut(OutputLine)) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(line) => sink(line),
            Err(_) => break,
        }
    }
}

/// Captured result of a command run under a deadline.
#[derive(Debug, Default)]
pub struct BoundedOutput {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl BoundedOutput {
    fn push_line(&mut self, line: OutputLine) {
        let target = match line.pipe {
            Pipe::Stdout => &mut self.stdout,
            Pipe::Stderr => &mut self.stderr,
        };
        target.push_str(&line.text);
        target.push('\n');
    }

    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.is_some_and(|status| status.success())
    }

    /// Short human-readable reason for a failed command.
    pub fn diagnostic(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        if self.cancelled {
            return "cancelled".to_string();
        }
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let status = match self.status.and_then(|status| status.code()) {
            Some(code) => format!("exit {code}"),
            None => "terminated by signal".to_string(),
        };
        if text.is_empty() {
            status
        } else {
            format!("{status}: {}", truncate_string(text, MAX_DIAGNOSTIC_BYTES))
        }
    }
}

/// Run `cmd` to completion, bounded by `timeout` and optionally by `cancel`.
///
/// Errors only when the command cannot be spawned.
pub fn run_bounded(
    cmd: &mut Command,
    timeout: Duration,
    cancel: Option<&CancelToken>,
    grace: Duration,
) -> std::io::Result<BoundedOutput> {
    let mut child = spawn_grouped(cmd)?;
    let rx = line_channel(&mut child);
    let deadline = Instant::now() + timeout;
    let mut output = BoundedOutput::default();

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => output.push_line(line),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL_INTERVAL),
        }
        if let Ok(Some(status)) = child.try_wait() {
            output.status = Some(status);
            break;
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            output.cancelled = true;
            output.status = terminate(&mut child, grace);
            break;
        }
        if Instant::now() >= deadline {
            output.timed_out = true;
            output.status = terminate(&mut child, grace);
            break;
        }
    }
    drain_lines(&rx, |line| output.push_line(line));
    Ok(output)
}
