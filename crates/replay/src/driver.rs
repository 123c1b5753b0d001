use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::{ReplayConfig, ReplaySequencer, ReplaySnapshot};

/// Drives a [`ReplaySequencer`] from a tokio interval. At most one ticking
/// task exists per driver.
pub struct ReplayDriver {
    sequencer: Arc<Mutex<ReplaySequencer>>,
    task: Option<JoinHandle<()>>,
}

impl ReplayDriver {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            sequencer: Arc::new(Mutex::new(ReplaySequencer::new(config))),
            task: None,
        }
    }

    /// Read access for renderers. Do not hold the guard across an await.
    pub fn sequencer(&self) -> MutexGuard<'_, ReplaySequencer> {
        lock(&self.sequencer)
    }

    /// Whether the ticking task is still alive.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancels any previous run and replays `snapshot` from the start. Must be
    /// called from within a tokio runtime.
    pub fn start(&mut self, snapshot: Arc<ReplaySnapshot>) {
        self.cancel();
        let period = {
            let mut sequencer = lock(&self.sequencer);
            sequencer.start(snapshot);
            if !sequencer.is_running() {
                return;
            }
            sequencer.config().tick
        };
        let sequencer = Arc::clone(&self.sequencer);
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                interval.tick().await;
                let running = lock(&sequencer).tick();
                if !running {
                    break;
                }
            }
            debug!("replay task exited");
        }));
    }

    /// Stops ticking and freezes the cursor.
    pub fn stop(&mut self) {
        self.cancel();
        lock(&self.sequencer).stop();
    }

    /// Resolves once the current run has finished or was cancelled.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.take() {
            report_exit(task.await);
        }
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ReplayDriver {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Logs a tick task that died instead of finishing or being cancelled.
/// Returns whether it failed.
fn report_exit(result: Result<(), JoinError>) -> bool {
    match result {
        Err(err) if !err.is_cancelled() => {
            warn!(error = %err, "replay task failed");
            true
        }
        _ => false,
    }
}

fn lock(sequencer: &Mutex<ReplaySequencer>) -> MutexGuard<'_, ReplaySequencer> {
    sequencer.lock().unwrap_or_else(PoisonError::into_inner)
}
