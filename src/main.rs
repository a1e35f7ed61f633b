use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod agent;
mod cancel;
mod catalog;
mod cli;
mod config;
mod container;
mod error;
mod orchestrator;
mod process;
mod report;
mod state;
mod util;
mod validation;
mod workflow;

const LOG_ENV: &str = "XBENCH_LOG";

fn init_tracing() {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let args = cli::RootArgs::parse();
    match workflow::run(args) {
        Ok(workflow::RunExit::Completed) => ExitCode::SUCCESS,
        Ok(workflow::RunExit::Cancelled) => ExitCode::from(cancel::EXIT_CANCELLED as u8),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
