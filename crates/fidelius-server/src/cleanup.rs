//! Background sweeper that keeps storage bounded.
//!
//! Consume already evicts expired rows lazily, but secrets nobody ever opens
//! would otherwise sit on disk forever. The scheduler calls [`Sweep::sweep`]
//! after a short startup delay and then on a fixed interval until cancelled.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SecretError;
use crate::rate_limit::RateLimiter;
use crate::store::Store;

/// Something that can drop its stale entries in one pass.
pub trait Sweep: Send + Sync + 'static {
    /// Short label used in log lines.
    fn name(&self) -> &'static str;

    /// Remove stale entries, returning how many went.
    fn sweep(&self) -> Result<usize, SecretError>;
}

impl Sweep for Store {
    fn name(&self) -> &'static str {
        "secrets"
    }

    fn sweep(&self) -> Result<usize, SecretError> {
        Store::sweep(self)
    }
}

impl Sweep for std::sync::Arc<RateLimiter> {
    fn name(&self) -> &'static str {
        "rate-limit buckets"
    }

    fn sweep(&self) -> Result<usize, SecretError> {
        Ok(self.evict_idle())
    }
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Wait before the first sweep (default: 5 seconds).
    pub startup_delay: Duration,
    /// Interval between sweeps (default: 60 minutes).
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(5),
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Handle to a running sweep loop.
///
/// Dropping the handle does not stop the task; call [`stop`](Self::stop) or
/// [`shutdown`](Self::shutdown).
pub struct CleanupScheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CleanupScheduler {
    /// Spawn the loop on the current tokio runtime.
    pub fn spawn<S: Sweep>(target: S, config: CleanupConfig) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(target, config, cancel.clone()));
        Self { cancel, task }
    }

    /// Signal the loop to exit. A sweep already in progress runs to completion.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Signal the loop to exit and wait for it.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "cleanup task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

async fn run_loop<S: Sweep>(target: S, config: CleanupConfig, cancel: CancellationToken) {
    info!(
        target_name = target.name(),
        interval_secs = config.interval.as_secs(),
        "cleanup task started"
    );

    tokio::select! {
        _ = cancel.cancelled() => {
            info!(target_name = target.name(), "cleanup task stopped before first sweep");
            return;
        }
        _ = time::sleep(config.startup_delay) => {}
    }

    let mut ticker = time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(target_name = target.name(), "cleanup task shutting down");
                break;
            }
            _ = ticker.tick() => run_cycle(&target),
        }
    }
}

/// One sweep. Errors are logged and swallowed so the next tick still runs.
fn run_cycle<S: Sweep>(target: &S) {
    match target.sweep() {
        Ok(0) => debug!(target_name = target.name(), "cleanup: nothing to remove"),
        Ok(removed) => info!(target_name = target.name(), removed, "cleanup removed expired entries"),
        Err(e) => warn!(target_name = target.name(), error = %e, "cleanup cycle failed"),
    }
}
