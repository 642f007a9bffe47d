//! Background idle-eviction task

use super::registry::SessionRegistry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle on the periodic idle sweep. Dropping it stops the sweep.
///
/// The task only holds a weak reference, so it never keeps a registry alive
/// on its own.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub(crate) fn spawn(registry: &SessionRegistry) -> Self {
        let weak = registry.downgrade();
        let period = registry.config().sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    tracing::debug!("registry dropped, stopping idle sweep");
                    break;
                };
                let evicted = registry.sweep_idle().await;
                if !evicted.is_empty() {
                    tracing::debug!(count = evicted.len(), "idle sweep evicted sessions");
                }
            }
        });

        tracing::debug!(interval_ms = period.as_millis() as u64, "idle sweep started");
        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
