use super::OutboxStore;
use crate::kafka::producer::{key_bytes, ProducerRouter};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Polls an [`OutboxStore`] and publishes what it finds.
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    router: Arc<ProducerRouter>,
    page_size: usize,
    poll_interval: Duration,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        router: Arc<ProducerRouter>,
        page_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            router,
            page_size: page_size.max(1),
            poll_interval,
        }
    }

    /// Publishes one page of pending records.
    ///
    /// Records go out one at a time in `created_at` order. The page is deleted
    /// only after every record was acknowledged; the first delivery error
    /// aborts the cycle and leaves the whole page pending.
    pub async fn dispatch_batch(&self) -> Result<usize> {
        let records = self.store.list_pending(self.page_size).await?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut published: Vec<Uuid> = Vec::with_capacity(records.len());
        for record in &records {
            self.router
                .publish_serialized(
                    &record.topic,
                    key_bytes(Uuid::new_v4()),
                    record.message.clone().into_bytes(),
                    record.headers(),
                )
                .await?;
            published.push(record.id);
        }

        let deleted = self.store.delete_by_ids(&published).await?;
        debug!(published = published.len(), deleted, "Outbox batch dispatched");
        Ok(published.len())
    }

    /// Dispatches until `cancel` fires. Cycle errors are logged, never fatal.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            page_size = self.page_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting outbox dispatcher"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.dispatch_batch().await {
                Ok(0) => {}
                Ok(count) => info!("Dispatched {} outbox record(s)", count),
                Err(e) => warn!("Outbox dispatch cycle failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Outbox dispatcher stopped");
        Ok(())
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
