//! Periodic sweep promoting silent in-progress tasks to LOST.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::types::TaskId;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// Trace silence after which a processing task is lost.
    pub stall_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct Watchdog {
    orchestrator: Orchestrator,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(orchestrator: Orchestrator, config: WatchdogConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Run one sweep and return the tasks marked lost.
    pub fn sweep_once(&self) -> Vec<TaskId> {
        let flagged = self
            .orchestrator
            .tracer()
            .sweep_stalled(self.config.stall_timeout);
        for task_id in &flagged {
            self.orchestrator.mark_lost(*task_id);
        }
        if !flagged.is_empty() {
            info!(count = flagged.len(), "watchdog marked tasks lost");
        }
        flagged
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_once();
                    }
                }
            }
            debug!("watchdog stopped");
        })
    }
}
