use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon_core::task::Method;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::runner::{HttpExecutor, Outcome};

// Restored snapshots have no upper bound on the interval; longer periods
// than this wait this long instead of overflowing the timer deadline.
const MAX_PERIOD: Duration = Duration::from_secs(10 * 365 * 86_400);

/// Everything a loop needs for one task: an owned copy of the immutable
/// fields and the run counter it shares with the registry.
#[derive(Debug, Clone)]
pub struct LoopTask {
    pub id: String,
    pub method: Method,
    pub url: String,
    pub interval: Duration,
    pub runs: Arc<AtomicU64>,
}

/// Start the execution loop of one task.
///
/// The loop calls the target once right away, then once per interval until
/// `cancel` fires. Cancellation is only observed between calls: a call in
/// flight always finishes (and is counted), but none starts afterwards. A
/// terminated loop is never restarted; a new task needs a new loop.
///
/// Calls never overlap. If one overruns the interval, the missed ticks are
/// collapsed into a single immediate one.
pub fn spawn_loop(task: LoopTask, executor: HttpExecutor, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(run_loop(task, executor, cancel))
}

async fn run_loop(task: LoopTask, executor: HttpExecutor, cancel: CancellationToken) {
    report(&task, executor.execute(&task).await);

    let period = task.interval.min(MAX_PERIOD);
    let start = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
    let mut tick = interval_at(start, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("[task {}] stopped after run={}", task.id, task.runs.load(Ordering::Relaxed));
                return;
            }
            _ = tick.tick() => {
                report(&task, executor.execute(&task).await);
            }
        }
    }
}

fn report(task: &LoopTask, outcome: Outcome) {
    match outcome {
        Outcome::Response { status, run } if status.is_success() => {
            info!("[task {}] {} {} -> {} (run={})", task.id, task.method, task.url, status, run);
        }
        Outcome::Response { status, run } => {
            warn!("[task {}] {} {} -> {} (run={})", task.id, task.method, task.url, status, run);
        }
        Outcome::Failed { ref error, .. } => {
            warn!("[task {}] {} {} failed: {} (run={})", task.id, task.method, task.url, error, outcome.run());
        }
    }
}
