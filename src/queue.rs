//! Bounded FIFO tag-read queue.
//!
//! Requests wait in a backlog of at most `max_backlog` entries and are started
//! in arrival order while fewer than `max_concurrent` reads are in flight.
//! Each finished read frees its slot and pulls the next request; nothing else
//! drives the queue. Every accepted request is answered exactly once.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::cache::{Cache, MemoryCache};
use crate::error::{ConfigError, FetchError, ParseError, ReadError};
use crate::genre::normalize_genre;
use crate::parser::{read_tags, RawTags, TagParser};
use crate::source::{AudioSource, FetchRange};

pub const MAX_BACKLOG: usize = 100;
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const MAX_CONCURRENT_LIMIT: usize = 200;
pub const PARTIAL_FETCH_BYTES: u64 = 256 * 1024;
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const PARSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_backlog: usize,
    pub partial_bytes: u64,
    pub fetch_timeout: Duration,
    pub parse_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_backlog: MAX_BACKLOG,
            partial_bytes: PARTIAL_FETCH_BYTES,
            fetch_timeout: FETCH_TIMEOUT,
            parse_timeout: PARSE_TIMEOUT,
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 || self.max_concurrent > MAX_CONCURRENT_LIMIT {
            return Err(ConfigError::Concurrency {
                got: self.max_concurrent,
                max: MAX_CONCURRENT_LIMIT,
            });
        }
        if self.max_backlog == 0 {
            return Err(ConfigError::Backlog);
        }
        Ok(())
    }
}

/// Tags handed back to callers. Cover art is only ever carried as a data URI.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lyrics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub in_flight: usize,
    pub backlog: usize,
    pub max_concurrent: usize,
    pub max_backlog: usize,
}

struct ReadRequest {
    track_id: String,
    resolve: oneshot::Sender<Option<TagResult>>,
}

#[derive(Default)]
struct State {
    backlog: VecDeque<ReadRequest>,
    in_flight: usize,
}

struct Inner {
    config: QueueConfig,
    source: Arc<dyn AudioSource>,
    parser: Arc<dyn TagParser>,
    tags: Arc<dyn Cache<TagResult>>,
    images: Arc<dyn Cache<String>>,
    state: Mutex<State>,
}

/// Handle to the queue. Clones share the same backlog, slots and caches.
#[derive(Clone)]
pub struct TagQueue {
    inner: Arc<Inner>,
}

impl TagQueue {
    /// Builds a queue with fresh in-memory caches.
    pub fn new(
        config: QueueConfig,
        source: Arc<dyn AudioSource>,
        parser: Arc<dyn TagParser>,
    ) -> Result<Self, ConfigError> {
        Self::with_caches(
            config,
            source,
            parser,
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryCache::new()),
        )
    }

    pub fn with_caches(
        config: QueueConfig,
        source: Arc<dyn AudioSource>,
        parser: Arc<dyn TagParser>,
        tags: Arc<dyn Cache<TagResult>>,
        images: Arc<dyn Cache<String>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                source,
                parser,
                tags,
                images,
                state: Mutex::new(State::default()),
            }),
        })
    }

    /// Asks for the tags of `track_id`.
    ///
    /// Admission happens immediately: a cached track or a full backlog yields
    /// an already-completed future. Otherwise the request is queued and the
    /// future completes once its read is done. The output is `None` whenever
    /// no tags could be produced, whatever the reason.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn request_tags(&self, track_id: impl Into<String>) -> BoxFuture<'static, Option<TagResult>> {
        let track_id = track_id.into();

        if let Some(hit) = self.inner.tags.get(&track_id) {
            debug!(track_id = %track_id, "tag cache hit");
            return future::ready(Some(hit)).boxed();
        }

        let (resolve, rx) = oneshot::channel();
        {
            let mut state = self.inner.state();
            let waiting = state.backlog.len();
            if waiting >= self.inner.config.max_backlog {
                warn!(track_id = %track_id, "rejecting tag read: {}", ReadError::Saturated(waiting));
                return future::ready(None).boxed();
            }
            state.backlog.push_back(ReadRequest { track_id, resolve });
        }

        self.inner.drain();
        rx.map(|answer| answer.unwrap_or(None)).boxed()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state();
        QueueStats {
            in_flight: state.in_flight,
            backlog: state.backlog.len(),
            max_concurrent: self.inner.config.max_concurrent,
            max_backlog: self.inner.config.max_backlog,
        }
    }

    pub fn tags_cache(&self) -> &Arc<dyn Cache<TagResult>> {
        &self.inner.tags
    }

    pub fn image_cache(&self) -> &Arc<dyn Cache<String>> {
        &self.inner.images
    }
}

/// Holds one in-flight slot; dropping it frees the slot and refills.
struct Slot {
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.inner.drain();
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain(self: &Arc<Self>) {
        let Ok(runtime) = Handle::try_current() else {
            // Dropping the senders answers every waiting caller with `None`.
            let abandoned = std::mem::take(&mut self.state().backlog);
            error!(abandoned = abandoned.len(), "tag queue drained outside a tokio runtime");
            return;
        };

        let ready: Vec<ReadRequest> = {
            let mut state = self.state();
            let mut ready = Vec::new();
            while state.in_flight < self.config.max_concurrent {
                let Some(request) = state.backlog.pop_front() else {
                    break;
                };
                state.in_flight += 1;
                ready.push(request);
            }
            ready
        };

        for request in ready {
            let slot = Slot {
                inner: Arc::clone(self),
            };
            let inner = Arc::clone(self);
            runtime.spawn(async move {
                let _slot = slot;
                inner.run(request).await;
            });
        }
    }

    async fn run(&self, request: ReadRequest) {
        let ReadRequest { track_id, resolve } = request;

        let outcome = AssertUnwindSafe(self.read(&track_id)).catch_unwind().await;
        let answer = match outcome {
            Ok(Ok(tags)) => Some(tags),
            Ok(Err(err)) => {
                log_failure(&track_id, &err);
                None
            }
            Err(panic) => {
                log_failure(&track_id, &ReadError::Internal(panic_message(&panic)));
                None
            }
        };

        if resolve.send(answer).is_err() {
            debug!(track_id = %track_id, "caller stopped waiting for tags");
        }
    }

    async fn read(&self, track_id: &str) -> Result<TagResult, ReadError> {
        // Another request for the same track may have finished while this one waited.
        if let Some(hit) = self.tags.get(track_id) {
            return Ok(hit);
        }

        let partial = self
            .fetch(track_id, FetchRange::Partial(self.config.partial_bytes))
            .await?;
        let raw = match self.parse(partial).await {
            Err(ReadError::Parse(err)) if err.is_truncated() => {
                debug!(track_id, %err, "partial read too short, fetching whole file");
                let full = self.fetch(track_id, FetchRange::Full).await?;
                self.parse(full).await?
            }
            other => other?,
        };

        Ok(self.store(track_id, raw))
    }

    async fn fetch(&self, track_id: &str, range: FetchRange) -> Result<Bytes, ReadError> {
        let limit = self.config.fetch_timeout;
        match tokio::time::timeout(limit, self.source.fetch(track_id, range)).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(err)) => Err(ReadError::fetch(range.label(), err)),
            Err(_) => Err(ReadError::fetch(range.label(), FetchError::Timeout(limit))),
        }
    }

    async fn parse(&self, data: Bytes) -> Result<RawTags, ReadError> {
        read_tags(self.parser.as_ref(), data, self.config.parse_timeout).await
    }

    fn store(&self, track_id: &str, raw: RawTags) -> TagResult {
        let picture_uri = raw.picture.map(|picture| picture.to_data_uri());
        if let Some(uri) = &picture_uri {
            self.images.set(track_id, uri.clone());
        }

        let result = TagResult {
            lyrics: raw.lyrics,
            picture_uri,
            genre: normalize_genre(raw.genre.as_deref()),
            year: raw.year,
        };
        self.tags.set(track_id, result.clone());
        result
    }
}

fn log_failure(track_id: &str, err: &ReadError) {
    match err {
        ReadError::Parse(ParseError::NoTag) => debug!(track_id, "track has no tag"),
        ReadError::Internal(_) => error!(track_id, error = %err, "tag read failed"),
        _ => warn!(track_id, error = %err, "tag read failed"),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "pipeline panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Callbacks, EmbeddedPicture};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    const PARTIAL: &[u8] = b"partial";
    const FULL: &[u8] = b"full file";
    const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

    type Respond = Box<dyn Fn(&str, FetchRange) -> Result<Bytes, FetchError> + Send + Sync>;

    /// Audio source that sleeps, records each call and tracks overlap.
    struct ScriptedSource {
        delay: Duration,
        respond: Respond,
        calls: Mutex<Vec<(String, FetchRange)>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(delay: Duration, respond: Respond) -> Arc<Self> {
            Arc::new(Self {
                delay,
                respond,
                calls: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        /// Partial reads return `PARTIAL`, full reads return `FULL`.
        fn by_range(delay: Duration) -> Arc<Self> {
            Self::new(
                delay,
                Box::new(|_: &str, range: FetchRange| {
                    Ok(Bytes::from_static(match range {
                        FetchRange::Partial(_) => PARTIAL,
                        FetchRange::Full => FULL,
                    }))
                }),
            )
        }

        fn calls(&self) -> Vec<(String, FetchRange)> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct Active<'a>(&'a AtomicUsize);

    impl Drop for Active<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AudioSource for ScriptedSource {
        async fn fetch(&self, track_id: &str, range: FetchRange) -> Result<Bytes, FetchError> {
            self.calls.lock().unwrap().push((track_id.to_string(), range));
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _active = Active(&self.active);
            tokio::time::sleep(self.delay).await;
            (self.respond)(track_id, range)
        }
    }

    type Outcome = Box<dyn Fn(&[u8]) -> Result<RawTags, ParseError> + Send + Sync>;

    /// Parser that answers synchronously from a closure over the payload.
    struct ScriptedParser(Outcome);

    impl TagParser for ScriptedParser {
        fn read(&self, data: Bytes, callbacks: Callbacks) {
            match (self.0)(&data) {
                Ok(tags) => (callbacks.on_success)(tags),
                Err(err) => (callbacks.on_error)(err),
            }
        }
    }

    fn parser(outcome: impl Fn(&[u8]) -> Result<RawTags, ParseError> + Send + Sync + 'static) -> Arc<ScriptedParser> {
        Arc::new(ScriptedParser(Box::new(outcome)))
    }

    fn truncated(data: &[u8]) -> ParseError {
        ParseError::Truncated {
            needed: data.len() + 1,
            available: data.len(),
        }
    }

    /// Partial payloads are too short; full payloads parse.
    fn needs_full_file() -> Arc<ScriptedParser> {
        parser(|data| {
            if data == FULL {
                Ok(RawTags {
                    genre: Some("rock;Rock/pop".to_string()),
                    ..RawTags::default()
                })
            } else {
                Err(truncated(data))
            }
        })
    }

    fn queue(max_concurrent: usize, source: &Arc<ScriptedSource>, parser: Arc<ScriptedParser>) -> TagQueue {
        TagQueue::new(
            QueueConfig::default().with_max_concurrent(max_concurrent),
            source.clone(),
            parser,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn twelve_tracks_never_exceed_five_in_flight() {
        let source = ScriptedSource::by_range(Duration::from_millis(200));
        let queue = queue(5, &source, needs_full_file());

        let pending: Vec<_> = (0..12).map(|i| queue.request_tags(format!("track-{i}"))).collect();
        let stats = queue.stats();
        assert_eq!(stats.in_flight, 5);
        assert_eq!(stats.backlog, 7);

        let results = future::join_all(pending).await;
        assert_eq!(results.len(), 12);
        for result in &results {
            assert_eq!(result.as_ref().unwrap().genre.as_deref(), Some("Rock, Pop"));
        }
        assert!(source.peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(source.calls().len(), 24);
        assert_eq!(queue.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_backlog_rejects_without_fetching() {
        let source = ScriptedSource::by_range(Duration::from_secs(60));
        let queue = queue(5, &source, needs_full_file());

        let accepted: Vec<_> = (0..105).map(|i| queue.request_tags(format!("slow-{i}"))).collect();
        assert_eq!(
            queue.stats(),
            QueueStats {
                in_flight: 5,
                backlog: 100,
                max_concurrent: 5,
                max_backlog: 100,
            }
        );

        let rejected = queue.request_tags("one-too-many").now_or_never();
        assert_eq!(rejected, Some(None));
        assert_eq!(queue.stats().in_flight, 5);
        assert_eq!(queue.stats().backlog, 100);

        // Every accepted read times out on the slow source and still answers.
        let results = future::join_all(accepted).await;
        assert!(results.iter().all(Option::is_none));
        let calls = source.calls();
        assert_eq!(calls.len(), 105);
        assert!(calls.iter().all(|(id, _)| id != "one-too-many"));
    }

    #[tokio::test(start_paused = true)]
    async fn cached_track_skips_the_network() {
        let source = ScriptedSource::by_range(Duration::from_millis(50));
        let queue = queue(5, &source, parser(|_| Ok(RawTags::default())));

        let first = queue.request_tags("a").await;
        assert!(first.is_some());

        let second = queue.request_tags("a").now_or_never();
        assert_eq!(second, Some(first));
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_partial_read_retries_with_whole_file_once() {
        let source = ScriptedSource::by_range(Duration::ZERO);
        let queue = queue(5, &source, needs_full_file());

        assert!(queue.request_tags("t").await.is_some());
        let ranges: Vec<FetchRange> = source.calls().into_iter().map(|(_, r)| r).collect();
        assert_eq!(ranges, vec![FetchRange::Partial(PARTIAL_FETCH_BYTES), FetchRange::Full]);
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_whole_file_gives_up() {
        let source = ScriptedSource::by_range(Duration::ZERO);
        let queue = queue(5, &source, parser(|data| Err(truncated(data))));

        assert_eq!(queue.request_tags("t").await, None);
        assert_eq!(source.calls().len(), 2);
        assert!(!queue.tags_cache().has("t"));
    }

    #[tokio::test(start_paused = true)]
    async fn other_parse_errors_do_not_escalate() {
        let source = ScriptedSource::by_range(Duration::ZERO);
        let queue = queue(5, &source, parser(|_| Err(ParseError::Malformed("bad frame".into()))));

        assert_eq!(queue.request_tags("t").await, None);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_status_resolves_none() {
        let source = ScriptedSource::new(Duration::ZERO, Box::new(|_: &str, _: FetchRange| Err(FetchError::Status(404))));
        let queue = queue(5, &source, needs_full_file());

        assert_eq!(queue.request_tags("missing").await, None);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_is_abandoned_at_ten_seconds() {
        let source = ScriptedSource::by_range(Duration::from_secs(30));
        let queue = queue(5, &source, needs_full_file());

        let started = Instant::now();
        assert_eq!(queue.request_tags("slow").await, None);
        assert!(started.elapsed() <= FETCH_TIMEOUT + TIMER_RESOLUTION);
        assert_eq!(source.active.load(Ordering::SeqCst), 0);
    }

    struct StallingParser;

    impl TagParser for StallingParser {
        fn read(&self, _data: Bytes, callbacks: Callbacks) {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                (callbacks.on_success)(RawTags::default());
            });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_parse_is_abandoned_at_five_seconds() {
        let source = ScriptedSource::by_range(Duration::ZERO);
        let queue = TagQueue::new(QueueConfig::default(), source.clone(), Arc::new(StallingParser)).unwrap();

        let started = Instant::now();
        assert_eq!(queue.request_tags("stuck").await, None);
        assert!(started.elapsed() <= PARSE_TIMEOUT + TIMER_RESOLUTION);

        // The parser's late answer must not land in the cache.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!queue.tags_cache().has("stuck"));
        assert_eq!(queue.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn picture_goes_to_image_cache_as_data_uri() {
        let source = ScriptedSource::by_range(Duration::ZERO);
        let queue = queue(
            5,
            &source,
            parser(|_| {
                Ok(RawTags {
                    lyrics: Some("[00:01.00]hi".to_string()),
                    picture: Some(EmbeddedPicture {
                        mime_type: "image/png".to_string(),
                        data: vec![1, 2, 3, 4],
                    }),
                    genre: None,
                    year: Some("1999".to_string()),
                })
            }),
        );

        let tags = queue.request_tags("art").await.unwrap();
        assert_eq!(tags.picture_uri.as_deref(), Some("data:image/png;base64,AQIDBA=="));
        assert_eq!(tags.year.as_deref(), Some("1999"));
        assert_eq!(tags.genre, None);
        assert_eq!(queue.image_cache().get("art"), tags.picture_uri);
        assert_eq!(queue.tags_cache().get("art"), Some(tags));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_parser_still_answers_and_frees_slot() {
        let source = ScriptedSource::by_range(Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let queue = queue(
            1,
            &source,
            parser(move |_| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("parser blew up");
                }
                Ok(RawTags::default())
            }),
        );

        let first = queue.request_tags("boom");
        let second = queue.request_tags("fine");
        assert_eq!(first.await, None);
        assert!(second.await.is_some());
        assert_eq!(queue.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_requests_start_in_arrival_order() {
        let source = ScriptedSource::by_range(Duration::from_millis(10));
        let queue = queue(1, &source, parser(|_| Ok(RawTags::default())));

        let ids = ["c", "a", "d", "b"];
        let pending: Vec<_> = ids.iter().map(|id| queue.request_tags(*id)).collect();
        future::join_all(pending).await;

        let order: Vec<String> = source.calls().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, ids);
        assert_eq!(source.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_caches_are_visible_to_collaborators() {
        let source = ScriptedSource::by_range(Duration::ZERO);
        let tags: Arc<MemoryCache<TagResult>> = Arc::new(MemoryCache::new());
        let images: Arc<MemoryCache<String>> = Arc::new(MemoryCache::new());
        tags.set(
            "preloaded",
            TagResult {
                lyrics: Some("known".to_string()),
                ..TagResult::default()
            },
        );

        let queue = TagQueue::with_caches(
            QueueConfig::default(),
            source.clone(),
            parser(|_| Ok(RawTags::default())),
            tags.clone(),
            images.clone(),
        )
        .unwrap();

        let hit = queue.request_tags("preloaded").await.unwrap();
        assert_eq!(hit.lyrics.as_deref(), Some("known"));
        assert!(source.calls().is_empty());

        queue.request_tags("fresh").await.unwrap();
        assert!(tags.has("fresh"));
        assert!(images.is_empty());
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        let source = ScriptedSource::by_range(Duration::ZERO);
        let err = TagQueue::new(
            QueueConfig::default().with_max_concurrent(0),
            source.clone(),
            needs_full_file(),
        )
        .err();
        assert_eq!(err, Some(ConfigError::Concurrency { got: 0, max: 200 }));
        assert!(QueueConfig::default().with_max_concurrent(200).validate().is_ok());
        assert!(QueueConfig::default().with_max_concurrent(201).validate().is_err());
    }

    #[test]
    fn serializes_camel_case_and_skips_missing() {
        let tags = TagResult {
            picture_uri: Some("data:image/jpeg;base64,AA==".to_string()),
            ..TagResult::default()
        };
        assert_eq!(
            serde_json::to_string(&tags).unwrap(),
            r#"{"pictureUri":"data:image/jpeg;base64,AA=="}"#
        );
    }
}
