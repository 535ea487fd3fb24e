//! Long-lived subscription to the provider's push-event stream.
//!
//! ```text
//!            start()
//!  STOPPED ──────────▶ CONNECTING ──ok──▶ STREAMING ──frame──┐
//!     ▲                  ▲   │                │   ▲──────────┘
//!     │ fatal /          │   │ retryable      │ retryable
//!     │ exhausted /    timer  ▼                ▼
//!     └── stop() ───── RECONNECTING ◀──────────┘
//! ```
//!
//! Exactly one task owns the connection. `start()` and `stop()` serialize on a
//! mutex, and every await inside the task (connect, read, backoff sleep) races
//! a shutdown signal, so a stop never leaves a retry armed.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::events::StreamEvent;
use super::sse::{ByteStream, EventSource, FrameDecoder, SseFrame};
use crate::error::{SinkError, StreamError};
use crate::sink::FixtureSink;

/// Connectivity failures of the store are retried this many times per event.
const SINK_RETRIES: u32 = 3;
const SINK_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Stopped,
    Connecting,
    Streaming,
    Reconnecting,
}

/// Why a subscription task ended.
#[derive(Debug)]
pub enum SessionEnd {
    Cancelled,
    RetriesExhausted { attempts: u32, last_error: StreamError },
    Fatal(StreamError),
}

#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    pub backoff: BackoffPolicy,
    /// Treat a session that yields no bytes for this long as disconnected
    pub idle_timeout: Option<Duration>,
    /// How long `stop()` waits for the task before aborting it
    pub stop_grace: Duration,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        SubscriberOptions {
            backoff: BackoffPolicy::default(),
            idle_timeout: None,
            stop_grace: Duration::from_secs(5),
        }
    }
}

struct ActiveSubscription {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<SessionEnd>,
}

pub struct StreamSubscriber {
    source: Arc<dyn EventSource>,
    sink: Arc<dyn FixtureSink>,
    options: SubscriberOptions,
    state: Arc<watch::Sender<SubscriptionState>>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl StreamSubscriber {
    pub fn new(
        source: Arc<dyn EventSource>,
        sink: Arc<dyn FixtureSink>,
        options: SubscriberOptions,
    ) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Stopped);
        StreamSubscriber {
            source,
            sink,
            options,
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Begin a new subscription, tearing down any previous one first.
    pub async fn start(&self) {
        let mut active = self.active.lock().await;
        if let Some(prev) = active.take() {
            info!("Restarting event stream subscription");
            teardown(prev, self.options.stop_grace).await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state.send_replace(SubscriptionState::Connecting);
        let session = Session {
            source: Arc::clone(&self.source),
            sink: Arc::clone(&self.sink),
            options: self.options.clone(),
            state: Arc::clone(&self.state),
            shutdown: shutdown_rx,
            last_event_id: None,
            attempt: 0,
        };
        let handle = tokio::spawn(session.run());
        *active = Some(ActiveSubscription { shutdown_tx, handle });
    }

    /// Cancel the subscription from whatever state it is in. Once this
    /// returns the task is gone and will not write to the sink again.
    /// Returns how the task ended, or `None` if nothing was started.
    pub async fn stop(&self) -> Option<SessionEnd> {
        let mut active = self.active.lock().await;
        let end = match active.take() {
            Some(prev) => Some(teardown(prev, self.options.stop_grace).await),
            None => None,
        };
        self.state.send_replace(SubscriptionState::Stopped);
        end
    }
}

async fn teardown(sub: ActiveSubscription, grace: Duration) -> SessionEnd {
    // The task may already have finished on its own.
    let _ = sub.shutdown_tx.send(true);
    let mut handle = sub.handle;
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(end)) => end,
        Ok(Err(e)) => {
            error!("Event stream task failed: {}", e);
            SessionEnd::Cancelled
        }
        Err(_) => {
            warn!("Event stream task did not stop within {:?}, aborting", grace);
            handle.abort();
            let _ = handle.await;
            SessionEnd::Cancelled
        }
    }
}

enum PumpEnd {
    Cancelled,
    Failed(StreamError),
}

/// State owned by one subscription task.
struct Session {
    source: Arc<dyn EventSource>,
    sink: Arc<dyn FixtureSink>,
    options: SubscriberOptions,
    state: Arc<watch::Sender<SubscriptionState>>,
    shutdown: watch::Receiver<bool>,
    last_event_id: Option<String>,
    /// Consecutive retryable failures since the last healthy session
    attempt: u32,
}

impl Session {
    async fn run(mut self) -> SessionEnd {
        loop {
            self.set_state(SubscriptionState::Connecting);
            info!("Connecting to event stream: {}", self.source.url());

            let connected = tokio::select! {
                biased;
                _ = self.shutdown.changed() => None,
                res = self.source.connect(self.last_event_id.as_deref()) => Some(res),
            };
            let failure = match connected {
                None => return self.cancelled(),
                Some(Err(e)) => e,
                Some(Ok(stream)) => {
                    self.set_state(SubscriptionState::Streaming);
                    info!("Event stream connected");
                    match self.pump(stream).await {
                        PumpEnd::Cancelled => return self.cancelled(),
                        PumpEnd::Failed(e) => e,
                    }
                }
            };

            if !failure.is_retryable() {
                error!("Event stream failed, not retrying; subscription stopped: {}", failure);
                self.set_state(SubscriptionState::Stopped);
                return SessionEnd::Fatal(failure);
            }
            if self.options.backoff.is_exhausted(self.attempt) {
                error!(
                    "Event stream gave up after {} reconnect attempts; subscription stopped: {}",
                    self.attempt, failure
                );
                self.set_state(SubscriptionState::Stopped);
                return SessionEnd::RetriesExhausted {
                    attempts: self.attempt,
                    last_error: failure,
                };
            }

            let delay = self.options.backoff.delay_for(self.attempt);
            self.attempt += 1;
            self.set_state(SubscriptionState::Reconnecting);
            warn!(
                "Event stream lost ({}), reconnect attempt #{} in {:?}",
                failure, self.attempt, delay
            );

            let cancelled = tokio::select! {
                biased;
                _ = self.shutdown.changed() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                return self.cancelled();
            }
        }
    }

    /// Read and dispatch frames until the session fails or is cancelled.
    async fn pump(&mut self, mut stream: ByteStream) -> PumpEnd {
        let mut decoder = FrameDecoder::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return PumpEnd::Cancelled,
                next = next_chunk(&mut stream, self.options.idle_timeout) => next,
            };
            let chunk = match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    if decoder.pending() > 0 {
                        debug!("Discarding {} bytes of unterminated frame", decoder.pending());
                    }
                    return PumpEnd::Failed(StreamError::Disconnected);
                }
                Err(e) => return PumpEnd::Failed(e),
            };

            for frame in decoder.push(&chunk) {
                if self.attempt > 0 {
                    info!("Event stream healthy, resetting retry counter");
                    self.attempt = 0;
                }
                if let Some(id) = &frame.id {
                    self.last_event_id = Some(id.clone());
                }
                self.dispatch(frame).await;
            }
        }
    }

    async fn dispatch(&self, frame: SseFrame) {
        let event = match StreamEvent::decode(&frame) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping `{}` frame: {} (data: {})", frame.event, e, frame.data);
                return;
            }
        };
        if let StreamEvent::Ignored(kind) = &event {
            debug!("Ignoring `{}` event", kind);
            return;
        }

        let mut delay = SINK_RETRY_DELAY;
        for attempt in 0..=SINK_RETRIES {
            let err = match self.apply(&event).await {
                Ok(()) => return,
                Err(e) => e,
            };
            match err {
                SinkError::Connectivity(_) if attempt < SINK_RETRIES => {
                    warn!("Store unavailable, retrying {:?} in {:?}: {}", event, delay, err);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                SinkError::Connectivity(_) => {
                    error!("Dropping {:?} after {} store attempts: {}", event, attempt + 1, err);
                }
                SinkError::Constraint(_) => {
                    warn!("Store rejected {:?}: {}", event, err);
                    return;
                }
            }
        }
    }

    async fn apply(&self, event: &StreamEvent) -> Result<(), SinkError> {
        match event {
            StreamEvent::Upsert(fixture) => {
                match (fixture.final_score(), fixture.final_winner()) {
                    (Some((home, away)), winner) => info!(
                        "Game {} final: {} {} - {} {} (winner: {})",
                        fixture.id,
                        fixture.home_team,
                        home,
                        away,
                        fixture.away_team,
                        winner.unwrap_or("draw")
                    ),
                    _ => debug!("Upserting game {} from stream", fixture.id),
                }
                self.sink.upsert_all(std::slice::from_ref(fixture)).await
            }
            StreamEvent::Remove(id) => {
                info!("Game {} removed upstream", id);
                self.sink.remove(*id).await
            }
            StreamEvent::Ignored(_) => Ok(()),
        }
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state.send_replace(state);
    }

    fn cancelled(&self) -> SessionEnd {
        info!("Event stream subscription cancelled");
        self.set_state(SubscriptionState::Stopped);
        SessionEnd::Cancelled
    }
}

async fn next_chunk(
    stream: &mut ByteStream,
    idle_timeout: Option<Duration>,
) -> Result<Option<Vec<u8>>, StreamError> {
    let next = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next())
            .await
            .map_err(|_| StreamError::Idle(limit))?,
        None => stream.next().await,
    };
    next.transpose()
}
