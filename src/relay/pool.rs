//! Work-item pool
//!
//! Runs `parallel` work items as tasks on the current runtime. The first
//! fatal error aborts the rest and is returned to the caller.

use super::work::{RelaySettings, WorkItem};
use crate::error::RelayError;
use crate::transport::mqtt::{Connection, MqttContext};
use crate::transport::RelayContext;
use tokio::task::JoinSet;
use tracing::{error, info, Instrument};

/// Fixed-size set of work items
pub struct WorkerPool<C: RelayContext + 'static> {
    items: Vec<WorkItem<C>>,
}

impl<C: RelayContext + 'static> WorkerPool<C> {
    /// One work item per context
    pub fn new<I>(contexts: I, settings: &RelaySettings) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let items = contexts
            .into_iter()
            .map(|ctx| WorkItem::new(ctx, settings.clone()))
            .collect();
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drive every work item until all finish or one fails
    pub async fn run(self) -> Result<(), RelayError> {
        if self.items.is_empty() {
            return Err(RelayError::invalid_state("work-item pool is empty"));
        }

        info!(work_items = self.items.len(), "Starting relay");
        let mut tasks = JoinSet::new();
        for item in self.items {
            let span = crate::relay_span!(work_id = item.id());
            tasks.spawn(item.run().instrument(span));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Relay stopped: {}", e);
                    tasks.abort_all();
                    return Err(e);
                }
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    tasks.abort_all();
                    return Err(RelayError::invalid_state(format!(
                        "work item task failed: {join_error}"
                    )));
                }
            }
        }

        info!("All work items finished");
        Ok(())
    }
}

impl WorkerPool<MqttContext> {
    /// `parallel` work items, each with its own context on `connection`
    pub fn for_connection(
        connection: &Connection,
        parallel: usize,
        settings: &RelaySettings,
    ) -> Self {
        Self::new(
            (0..parallel).map(|_| connection.open_context()),
            settings,
        )
    }
}
