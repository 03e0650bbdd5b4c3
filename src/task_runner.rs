/// Task Runner with cooperative stop and failure backoff
///
/// The session loop runs one cycle at a time. A failed cycle never ends the
/// loop: it is logged, the next poll is delayed with exponential backoff, and
/// the loop only exits once its [`StopSignal`] fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Cloneable stop flag with an awaitable edge
///
/// Every await point of a long operation races against [`StopSignal::stopped`]
/// so the whole operation unwinds as one unit.
#[derive(Debug, Clone)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
    tx: broadcast::Sender<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`StopSignal::trigger`] has been called
    pub async fn stopped(&self) {
        // subscribe before reading the flag so a concurrent trigger is not missed
        let mut rx = self.tx.subscribe();
        if self.is_stopped() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Sleep unless stopped first; returns false when interrupted
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.stopped() => false,
            _ = sleep(duration) => true,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff configuration for the cycle loop
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_retry_delay: Duration,
    /// Maximum delay between retries
    pub max_retry_delay: Duration,
}

#[derive(Debug)]
struct BackoffState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl BackoffState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    fn record_failure(&mut self, max_delay: Duration) -> Duration {
        self.consecutive_failures += 1;
        let delay = self.current_retry_delay;
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
        delay
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Run `cycle_fn` until `stop` fires
///
/// On success the cycle returns how long to wait before the next one. On
/// failure the wait doubles per consecutive failure up to the configured cap.
pub async fn run_cycles<F, Fut>(
    task_name: &str,
    config: BackoffConfig,
    stop: StopSignal,
    mut cycle_fn: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Duration, String>>,
{
    let mut state = BackoffState::new(config.initial_retry_delay);
    info!("Task '{}' started", task_name);

    while !stop.is_stopped() {
        let wait = match cycle_fn().await {
            Ok(next_poll) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
                next_poll
            }
            Err(e) => {
                let delay = state.record_failure(config.max_retry_delay);
                error!(
                    "Task '{}' cycle failed ({} in a row), retrying in {:?}: {}",
                    task_name, state.consecutive_failures, delay, e
                );
                delay
            }
        };

        if !stop.sleep(wait).await {
            break;
        }
    }

    info!("Task '{}' stopped", task_name);
}
