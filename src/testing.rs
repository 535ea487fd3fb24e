//! Scripted stand-ins for the provider, the store and the event stream.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::db::models::Fixture;
use crate::error::{FetchError, SinkError, StreamError};
use crate::ingest::sse::{ByteStream, EventSource};
use crate::provider::FixtureProvider;
use crate::sink::FixtureSink;

// ── Provider ─────────────────────────────────────────────────────────────────

/// Serves canned bodies keyed by `(year, round)`; `round = None` is the
/// season query. Unknown keys answer `{"games":[]}`.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<HashMap<(i32, Option<i32>), Result<String, u16>>>,
    calls: Mutex<Vec<(i32, Option<i32>)>>,
}

impl ScriptedProvider {
    pub fn respond(&self, year: i32, round: Option<i32>, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert((year, round), Ok(body.to_string()));
    }

    pub fn fail(&self, year: i32, round: Option<i32>, status: u16) {
        self.responses
            .lock()
            .unwrap()
            .insert((year, round), Err(status));
    }

    pub fn calls(&self) -> Vec<(i32, Option<i32>)> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, year: i32, round: Option<i32>) -> Result<String, FetchError> {
        self.calls.lock().unwrap().push((year, round));
        match self.responses.lock().unwrap().get(&(year, round)) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(status)) => Err(FetchError::Status {
                url: format!("scripted://{}/{:?}", year, round),
                status: *status,
            }),
            None => Ok(r#"{"games":[]}"#.to_string()),
        }
    }
}

#[async_trait]
impl FixtureProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_by_year(&self, year: i32) -> Result<String, FetchError> {
        self.answer(year, None)
    }

    async fn fetch_by_year_and_round(&self, year: i32, round: i32) -> Result<String, FetchError> {
        self.answer(year, Some(round))
    }
}

/// JSON for a minimal game.
pub fn game_json(id: i64, round: i32, year: i32, complete: i64) -> String {
    format!(
        r#"{{"id":{},"round":{},"year":{},"hteam":"Home","ateam":"Away","complete":{}}}"#,
        id, round, year, complete
    )
}

pub fn games_body(games: &[String]) -> String {
    format!(r#"{{"games":[{}]}}"#, games.join(","))
}

// ── Sink ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Upsert(Vec<i64>),
    Remove(i64),
}

/// Records every call and keeps a map by id. Queued errors are returned
/// (one per call) before any real write happens.
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    fixtures: Mutex<HashMap<i64, Fixture>>,
    failures: Mutex<VecDeque<SinkError>>,
    writes: watch::Sender<usize>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        RecordingSink {
            calls: Mutex::default(),
            fixtures: Mutex::default(),
            failures: Mutex::default(),
            writes: watch::channel(0).0,
        }
    }
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stored(&self) -> HashMap<i64, Fixture> {
        self.fixtures.lock().unwrap().clone()
    }

    pub fn fail_next(&self, err: SinkError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Wait until at least `n` calls (successful or not) were made.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.writes.subscribe();
        rx.wait_for(|c| *c >= n).await.unwrap();
    }

    fn record(&self, call: SinkCall) -> Result<(), SinkError> {
        self.calls.lock().unwrap().push(call);
        self.writes.send_modify(|c| *c += 1);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FixtureSink for RecordingSink {
    async fn upsert_all(&self, fixtures: &[Fixture]) -> Result<(), SinkError> {
        self.record(SinkCall::Upsert(fixtures.iter().map(|f| f.id).collect()))?;
        let mut map = self.fixtures.lock().unwrap();
        for f in fixtures {
            map.insert(f.id, f.clone());
        }
        Ok(())
    }

    async fn remove(&self, id: i64) -> Result<(), SinkError> {
        self.record(SinkCall::Remove(id))?;
        self.fixtures.lock().unwrap().remove(&id);
        Ok(())
    }
}

// ── Event source ─────────────────────────────────────────────────────────────

/// How a served session ends after its chunks.
pub enum Tail {
    /// Stay open forever
    Hang,
    /// Clean end of body
    Close,
    Error(StreamError),
}

pub enum Script {
    Fail(StreamError),
    Serve { chunks: Vec<&'static str>, tail: Tail },
}

impl Script {
    pub fn serve(chunks: Vec<&'static str>, tail: Tail) -> Self {
        Script::Serve { chunks, tail }
    }
}

/// Plays one `Script` per `connect`. Once the scripts run out, `connect`
/// never completes.
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    connects: watch::Sender<usize>,
    connect_times: Mutex<Vec<Instant>>,
    last_event_ids: Mutex<Vec<Option<String>>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(scripts: Vec<Script>) -> Self {
        ScriptedSource {
            scripts: Mutex::new(scripts.into()),
            connects: watch::channel(0).0,
            connect_times: Mutex::default(),
            last_event_ids: Mutex::default(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connects(&self) -> usize {
        *self.connects.borrow()
    }

    pub async fn wait_for_connects(&self, n: usize) {
        let mut rx = self.connects.subscribe();
        rx.wait_for(|c| *c >= n).await.unwrap();
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().unwrap().clone()
    }

    pub fn last_event_ids(&self) -> Vec<Option<String>> {
        self.last_event_ids.lock().unwrap().clone()
    }

    /// Sessions whose body stream has not been dropped yet.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    fn url(&self) -> &str {
        "scripted://sse/games"
    }

    async fn connect(&self, last_event_id: Option<&str>) -> Result<ByteStream, StreamError> {
        self.connect_times.lock().unwrap().push(Instant::now());
        self.last_event_ids
            .lock()
            .unwrap()
            .push(last_event_id.map(str::to_string));
        let script = self.scripts.lock().unwrap().pop_front();
        self.connects.send_modify(|c| *c += 1);

        let (chunks, tail) = match script {
            None => std::future::pending().await,
            Some(Script::Fail(err)) => return Err(err),
            Some(Script::Serve { chunks, tail }) => (chunks, tail),
        };

        let tail: ByteStream = match tail {
            Tail::Hang => stream::pending().boxed(),
            Tail::Close => stream::empty().boxed(),
            Tail::Error(err) => stream::once(async move { Err(err) }).boxed(),
        };
        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));
        let body = stream::iter(chunks.into_iter().map(|c| Ok(c.as_bytes().to_vec())))
            .chain(tail)
            .map(move |item| {
                let _alive = &guard;
                item
            });
        Ok(body.boxed())
    }
}
