pub mod backoff;
pub mod bulk;
pub mod events;
pub mod sse;
pub mod stream;

pub use backoff::BackoffPolicy;
pub use bulk::{BulkSynchronizer, SyncOptions, SyncSummary};
pub use sse::{EventSource, SseSource};
pub use stream::{SessionEnd, StreamSubscriber, SubscriberOptions, SubscriptionState};

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::provider::FixtureProvider;
use crate::sink::FixtureSink;

/// The ingestion pipeline as seen by the host process: one live stream
/// subscription plus on-demand bulk syncs, both feeding the same sink.
pub struct IngestionEngine {
    subscriber: StreamSubscriber,
    synchronizer: BulkSynchronizer,
}

impl IngestionEngine {
    pub fn new(
        provider: Arc<dyn FixtureProvider>,
        source: Arc<dyn EventSource>,
        sink: Arc<dyn FixtureSink>,
        subscriber_options: SubscriberOptions,
        sync_options: SyncOptions,
    ) -> Self {
        IngestionEngine {
            subscriber: StreamSubscriber::new(source, Arc::clone(&sink), subscriber_options),
            synchronizer: BulkSynchronizer::new(provider, sink, sync_options),
        }
    }

    /// Start the live subscription. A no-op while one is already running;
    /// after the subscription stopped on its own, this starts a fresh one.
    pub async fn initialize(&self) {
        if self.subscriber.state() != SubscriptionState::Stopped {
            return;
        }
        info!("Starting ingestion engine");
        self.subscriber.start().await;
    }

    /// Stop the live subscription and release its connection. Idempotent.
    pub async fn shutdown(&self) {
        match self.subscriber.stop().await {
            Some(SessionEnd::RetriesExhausted {
                attempts,
                last_error,
            }) => warn!(
                "Ingestion engine stopped; stream had given up after {} attempts: {}",
                attempts, last_error
            ),
            Some(SessionEnd::Fatal(e)) => {
                warn!("Ingestion engine stopped; stream had failed: {}", e)
            }
            Some(SessionEnd::Cancelled) => info!("Ingestion engine stopped"),
            None => {}
        }
    }

    pub async fn sync_up_to_latest_completed_round(
        &self,
        year: i32,
    ) -> Result<SyncSummary, SyncError> {
        self.synchronizer.sync_up_to_latest_completed_round(year).await
    }

    pub fn stream_state(&self) -> SubscriptionState {
        self.subscriber.state()
    }
}
