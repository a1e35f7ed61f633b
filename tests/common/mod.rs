//! Shared test infrastructure for integration tests.
//!
//! A fixture is a throwaway catalog plus shell stand-ins for the container
//! engine and the agent. The fake engine appends every compose subcommand to
//! a log file so tests can check what was built and torn down.

use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const FAKE_DOCKER: &str = r#"#!/bin/sh
# compose -f FILE -p PROJECT SUBCOMMAND ...
project="$5"
sub="$6"
echo "$sub $project" >> "$FAKE_DOCKER_LOG"
case "$sub" in
  build)
    if [ "$project" = "$FAKE_DOCKER_FAIL_BUILD" ]; then
      echo "failed to solve: exit code 2" >&2
      exit 1
    fi
    ;;
  ps)
    # The first $FAKE_DOCKER_LATE_HEALTH / $FAKE_DOCKER_LATE_PORTS polls see
    # a service that is still settling.
    if [ "$7" = "--all" ]; then
      kind=health
      wait="${FAKE_DOCKER_LATE_HEALTH:-0}"
    else
      kind=ports
      wait="${FAKE_DOCKER_LATE_PORTS:-0}"
    fi
    counter="$FAKE_DOCKER_LOG.$project.$kind"
    seen=$(cat "$counter" 2>/dev/null || echo 0)
    echo "$(expr "$seen" + 1)" > "$counter"
    late=$([ "$seen" -lt "$wait" ] && echo yes)
    if [ "$kind" = health ]; then
      if [ -n "$late" ]; then
        echo "Up 1 second (health: starting)"
      else
        echo "Up 1 second (healthy)"
      fi
    elif [ -n "$late" ]; then
      echo "0.0.0.0:49999->22/tcp"
    else
      n=$(echo "$project" | sed 's/[^0-9]*\([0-9][0-9]*\).*/\1/')
      echo "0.0.0.0:$(expr "$n" + 40000)->80/tcp"
    fi
    ;;
esac
exit 0
"#;

const FAKE_AGENT: &str = r#"#!/bin/sh
target="$1"
port="${target##*:}"
n=$(expr "$port" - 40000)
if [ -n "$FAKE_AGENT_STARTED" ]; then
  touch "$FAKE_AGENT_STARTED"
fi
if [ -n "$FAKE_AGENT_HANG" ]; then
  sleep 60
fi
echo "attacking $target"
echo "captured FLAG{flag-$n}"
echo "[DONE] Flags: 1, Cost: \$0.25, Session: fake-$n"
sleep 30
"#;

/// Catalog, fake tools, and output root inside one temp directory.
pub struct Fixture {
    pub temp: TempDir,
    pub benchmarks_dir: PathBuf,
    pub output_dir: PathBuf,
    pub docker: PathBuf,
    pub agent: PathBuf,
    pub docker_log: PathBuf,
}

fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

impl Fixture {
    /// Create a catalog with benchmarks `XBEN-001-24` ..= `XBEN-{count}-24`.
    pub fn with_benchmarks(count: u32) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let benchmarks_dir = root.join("benchmarks");
        for n in 1..=count {
            let dir = benchmarks_dir.join(format!("XBEN-{n:03}-24"));
            fs::create_dir_all(&dir).unwrap();
            let definition = serde_json::json!({
                "name": format!("Bench {n}"),
                "description": "fixture benchmark",
                "level": 1 + (n % 3),
                "tags": ["web"],
                "port": 80,
            });
            fs::write(dir.join("benchmark.json"), definition.to_string()).unwrap();
            fs::write(dir.join(".env"), format!("FLAG=\"FLAG{{flag-{n}}}\"\n")).unwrap();
            fs::write(
                dir.join("docker-compose.yml"),
                "services:\n  web:\n    image: fixture\n    ports:\n      - \"80\"\n",
            )
            .unwrap();
        }

        let bin = root.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let docker = bin.join("fake-docker");
        let agent = bin.join("fake-agent");
        write_executable(&docker, FAKE_DOCKER);
        write_executable(&agent, FAKE_AGENT);

        Self {
            benchmarks_dir,
            output_dir: root.join("logs"),
            docker,
            agent,
            docker_log: root.join("docker.log"),
            temp,
        }
    }

    /// The xbench command wired to this fixture, isolated from the host env.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_xbench"));
        for (name, _) in std::env::vars() {
            if name.starts_with("XBENCH_") {
                cmd.env_remove(name);
            }
        }
        cmd.env("HOME", self.temp.path())
            .env("XDG_CONFIG_HOME", self.temp.path().join("config"))
            .env("XBENCH_TARGET_HOST", "127.0.0.1")
            .env("FAKE_DOCKER_LOG", &self.docker_log)
            .arg("--benchmarks-dir")
            .arg(&self.benchmarks_dir)
            .arg("--output-dir")
            .arg(&self.output_dir)
            .arg("--docker")
            .arg(&self.docker)
            .arg("--agent-command")
            .arg(&self.agent);
        cmd
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.command().args(args).output().unwrap()
    }

    /// Lines the fake engine logged, e.g. `down xbench_xben-001-24`.
    pub fn docker_calls(&self) -> Vec<String> {
        fs::read_to_string(&self.docker_log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Write a JSON config file and return its path for `--config`.
    pub fn config_file(&self, config: Value) -> PathBuf {
        let path = self.temp.path().join("xbench.json");
        fs::write(&path, config.to_string()).unwrap();
        path
    }

    pub fn count_calls(&self, call: &str) -> usize {
        self.docker_calls().iter().filter(|line| *line == call).count()
    }

    /// Session directories under the output root, sorted by name.
    pub fn sessions(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.output_dir) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        dirs
    }
}

pub fn read_state(session_dir: &Path) -> Value {
    let text = fs::read_to_string(session_dir.join("state.json")).unwrap();
    serde_json::from_str(&text).unwrap()
}

pub fn outcome(state: &Value, id: &str) -> String {
    state["results"][id]["outcome"]
        .as_str()
        .unwrap_or("missing")
        .to_string()
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
