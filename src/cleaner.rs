use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, warn};

use crate::errors::StoreError;
use crate::runner::QueueConfig;
use crate::storage::JobStore;

/// Periodically removes finished jobs once they are older than the configured retention.
pub(crate) struct Cleaner {
    store: Arc<dyn JobStore>,
    retention: Duration,
    interval: Duration,
}

impl Cleaner {
    /// It is not necessary to return a `Cleaner` if no retention is configured
    pub(crate) fn for_config(config: &QueueConfig, store: Arc<dyn JobStore>) -> Option<Self> {
        Some(Self {
            store,
            retention: config.retention?,
            // tokio's interval rejects a zero period
            interval: config.cleanup_interval.max(Duration::from_millis(1)),
        })
    }

    pub(crate) fn start(self) -> AbortHandle {
        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                loop {
                    ticker.tick().await;
                    match prune(self.store.as_ref(), self.retention).await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Pruned finished jobs"),
                        Err(error) => warn!("Failed to prune finished jobs: {error}"),
                    }
                }
            }
            .in_current_span(),
        );
        task.abort_handle()
    }
}

/// Delete jobs that finished more than `age` ago.
pub(crate) async fn prune(store: &dyn JobStore, age: Duration) -> Result<u64, StoreError> {
    let cutoff = TimeDelta::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age));

    match cutoff {
        Some(cutoff) => store.prune_finished(cutoff).await,
        // nothing can have finished that long ago
        None => Ok(0),
    }
}
