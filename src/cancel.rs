//! Interrupt handling shared by the orchestrator and its subprocess waits.
//!
//! The first SIGINT/SIGTERM flips a shared flag that every suspension point
//! polls. A second signal exits immediately without teardown; state written
//! before that point survives, anything after it does not.
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Exit code used for an interrupted run.
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early on cancellation.
    ///
    /// Returns `false` if the token was cancelled before the sleep finished.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}

/// Route SIGINT/SIGTERM into `token`.
pub fn install_handler(token: CancelToken) -> Result<()> {
    let hits = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        let previous = hits.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            eprintln!("\nInterrupt received; tearing down the active benchmark and saving state...");
            eprintln!("(interrupt again to exit immediately without cleanup)");
            token.cancel();
        } else {
            eprintln!("\nSecond interrupt: exiting without cleanup; the active environment may still be running and the current trial is lost.");
            std::process::exit(EXIT_CANCELLED);
        }
    })
    .context("install interrupt handler")
}
