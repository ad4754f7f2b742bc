//! Background idle-connection sweeper.
//!
//! One task per manager, ticking every `sweep_interval`. It holds only a weak
//! reference, so dropping the last `Arc` to the manager also ends the loop.

use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::ConnectionPoolManager;
use crate::types::Result;

impl ConnectionPoolManager {
    /// Start the sweeper in the background. Idempotent while running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("pool_sweeper_already_running");
            return Ok(());
        }
        *slot = Some(spawn_sweeper(
            Arc::downgrade(self),
            self.config.sweep_interval,
            self.cancel.clone(),
        ));
        tracing::info!(
            "pool_sweeper_started: interval={:?}",
            self.config.sweep_interval
        );
        Ok(())
    }
}

fn spawn_sweeper(
    manager: Weak<ConnectionPoolManager>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("pool_sweeper_stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else {
                        tracing::debug!("pool_sweeper_orphaned");
                        break;
                    };
                    let evicted = manager.close_idle_connections().await;
                    tracing::debug!("pool_sweep_completed: evicted={}", evicted);
                }
            }
        }
    })
}
