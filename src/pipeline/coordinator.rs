//! # Pipeline Coordinator
//!
//! Composes the dedup store, cache registry, connection pool, task runner,
//! and processors into the per-event state machine:
//!
//! ```text
//! Received -> Deduping -> (Duplicate: Discarded)
//!                      -> (Accepted: CacheCheck) -> (Hit: Responding)
//!                                                -> (Miss: Processing)
//! Processing -> (Success: CachePopulate -> Responding)
//!            -> (Failure: Classify -> Responding with stale entry or fallback)
//! ```
//!
//! `Responding` always marks the fingerprint complete before anything goes
//! out, so platform redeliveries arriving after this point are duplicates of
//! a completed event. The pooled connection is held for the Processing call
//! only — never across cache or dedup operations — and the RAII guard
//! releases it on every exit path.

use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::caching::dedup::{DedupStore, RegisterOutcome};
use crate::caching::keys;
use crate::caching::registry::CacheRegistry;
use crate::caching::store::ResponseCache;
use crate::core::connection_pool::{ConnectionFactory, ConnectionPool};
use crate::core::error::{ErrorKind, PipelineError, PipelineResult};
use crate::core::recovery::RetryPolicy;
use crate::core::types::{EventPayload, InboundEvent, ProcessorOutput, Reply, ReplySource};
use crate::pipeline::processor::ProcessorSet;
use crate::pipeline::reply::ReplyChannel;
use crate::tasks::TaskRunner;

/// Per-event orchestration over the shared components
///
/// All shared state is injected at construction; the coordinator itself is
/// stateless per event and is shared across however many concurrent
/// deliveries the intake produces.
pub struct PipelineCoordinator<F: ConnectionFactory> {
    dedup: Arc<DedupStore>,
    caches: Arc<CacheRegistry>,
    pool: Arc<ConnectionPool<F>>,
    tasks: Arc<TaskRunner>,
    processors: ProcessorSet<F::Conn>,
    reply_channel: Arc<dyn ReplyChannel>,
    retry: RetryPolicy,
}

impl<F: ConnectionFactory> PipelineCoordinator<F> {
    /// Wire the coordinator over its collaborators
    pub fn new(
        dedup: Arc<DedupStore>,
        caches: Arc<CacheRegistry>,
        pool: Arc<ConnectionPool<F>>,
        tasks: Arc<TaskRunner>,
        processors: ProcessorSet<F::Conn>,
        reply_channel: Arc<dyn ReplyChannel>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            dedup,
            caches,
            pool,
            tasks,
            processors,
            reply_channel,
            retry,
        }
    }

    /// Run one inbound delivery through the pipeline
    ///
    /// Always runs to completion once accepted, even if the caller has
    /// stopped waiting: cache and dedup state must end up consistent either
    /// way, and a late reply is merely logged. The returned `Reply` mirrors
    /// what was (or would have been) delivered.
    pub async fn handle_event(&self, event: InboundEvent) -> PipelineResult<Reply> {
        let started = Instant::now();
        let fingerprint = keys::event_fingerprint(&event);
        counter!("events_received", "kind" => event.kind_label()).increment(1);

        match self.dedup.register(&fingerprint) {
            Ok(RegisterOutcome::Accepted) => {}
            Ok(RegisterOutcome::Duplicate { state }) => {
                debug!(
                    event_id = %event.event_id,
                    state = ?state,
                    "duplicate delivery discarded"
                );
                counter!("events_duplicate").increment(1);
                return Ok(Reply::duplicate_ack(event.event_id));
            }
            Err(err) => {
                // Fail-closed dedup store: degrade to a safe fallback reply
                // instead of hanging or double-processing.
                warn!(event_id = %event.event_id, error = %err, "dedup store rejected event");
                let reply = Reply::new(
                    event.event_id.clone(),
                    err.user_message().to_string(),
                    ReplySource::Fallback,
                );
                self.send_reply(&reply).await;
                return Ok(reply);
            }
        }

        let outcome = self.run_accepted(&event).await;

        // Terminal for this fingerprint regardless of how processing went;
        // any redelivery from here on is a duplicate of a completed event.
        self.dedup.complete(&fingerprint);

        let reply = match outcome {
            Ok(reply) => reply,
            Err(err) => {
                let kind = err.kind();
                counter!("pipeline_failures", "kind" => kind.as_str()).increment(1);
                if kind == ErrorKind::Fatal {
                    error!(
                        event_id = %event.event_id,
                        error = %err,
                        "fatal failure, aborting this event's pipeline"
                    );
                } else {
                    warn!(event_id = %event.event_id, kind = kind.as_str(), error = %err, "pipeline failure");
                }

                match self.stale_answer(&event, kind) {
                    Some(reply) => {
                        info!(event_id = %event.event_id, "serving stale cache entry while degraded");
                        reply
                    }
                    None => Reply::new(
                        event.event_id.clone(),
                        err.user_message().to_string(),
                        ReplySource::Fallback,
                    ),
                }
            }
        };

        self.send_reply(&reply).await;
        histogram!("pipeline_duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(reply)
    }

    /// Cache check, processing, and cache populate for an accepted event
    async fn run_accepted(&self, event: &InboundEvent) -> PipelineResult<Reply> {
        let cache_plan = self.cache_plan(event)?;

        if let Some((cache, key)) = &cache_plan {
            if let Some(bytes) = cache.get(key) {
                let output: ProcessorOutput = serde_json::from_slice(&bytes)
                    .map_err(|e| PipelineError::internal(format!("corrupt cache entry: {}", e)))?;
                debug!(event_id = %event.event_id, cache = cache.name(), "cache hit");
                return Ok(Reply::new(
                    event.event_id.clone(),
                    output.text,
                    ReplySource::Cache,
                ));
            }
        }

        let output = self.process_with_connection(event).await?;

        if let Some((cache, key)) = &cache_plan {
            cache.put(key, serde_json::to_vec(&output)?, None);
        }
        self.schedule_session_refresh(event, &output);

        Ok(Reply::new(
            event.event_id.clone(),
            output.text.clone(),
            ReplySource::Processor,
        ))
    }

    /// The Processing state: connection acquire/release is scoped to each
    /// attempt of this call and nothing else. A connection-level failure
    /// marks the borrowed connection broken so the pool discards it.
    async fn process_with_connection(
        &self,
        event: &InboundEvent,
    ) -> PipelineResult<ProcessorOutput> {
        let processor = self.processors.for_event(event)?;
        let op_name = processor.kind().as_str();
        let pool = Arc::clone(&self.pool);
        let processor = Arc::clone(processor);

        self.retry
            .run(op_name, move || {
                let pool = Arc::clone(&pool);
                let processor = Arc::clone(&processor);
                async move {
                    let mut conn = pool.acquire().await?;
                    let result = processor.process(event, &mut conn).await;
                    if let Err(err) = &result {
                        if matches!(err, PipelineError::Connection { .. }) {
                            conn.mark_broken();
                        }
                    }
                    result
                }
            })
            .await
    }

    /// Which cache instance and key serve this payload, if any
    #[allow(clippy::type_complexity)]
    fn cache_plan(
        &self,
        event: &InboundEvent,
    ) -> PipelineResult<Option<(Arc<ResponseCache>, String)>> {
        match &event.payload {
            EventPayload::Text { text, .. } => {
                Ok(Some((Arc::clone(&self.caches.nlp), keys::nlp_key(text))))
            }
            EventPayload::Image { content, .. } => Ok(Some((
                Arc::clone(&self.caches.image),
                keys::image_key(content),
            ))),
            // Session events carry no reusable answer.
            EventPayload::Follow { .. } => Ok(None),
            EventPayload::Unknown { kind } => Err(PipelineError::invalid_event(format!(
                "unsupported event kind '{}'",
                kind
            ))),
        }
    }

    /// A previously computed answer past its TTL beats no answer when
    /// downstream is failing; invalid input and fatal kinds never qualify.
    fn stale_answer(&self, event: &InboundEvent, kind: ErrorKind) -> Option<Reply> {
        if !matches!(
            kind,
            ErrorKind::Transient | ErrorKind::ResourceExhausted | ErrorKind::ExternalService
        ) {
            return None;
        }
        let (cache, key) = self.cache_plan(event).ok().flatten()?;
        let bytes = cache.get_stale(&key)?;
        let output: ProcessorOutput = serde_json::from_slice(&bytes).ok()?;
        counter!("pipeline_stale_served").increment(1);
        Some(Reply::new(
            event.event_id.clone(),
            output.text,
            ReplySource::StaleCache,
        ))
    }

    /// Refresh the user's session entry off the reply path. Fire-and-forget:
    /// rejection under queue pressure is acceptable and logged by the runner.
    fn schedule_session_refresh(&self, event: &InboundEvent, output: &ProcessorOutput) {
        let Some(user_id) = event.user_id() else { return };
        let session = Arc::clone(&self.caches.session);
        let key = keys::session_key(user_id);
        let value = output.text.clone();

        self.tasks.submit("session-refresh", move || {
            let session = Arc::clone(&session);
            let key = key.clone();
            let value = value.clone();
            async move {
                session.put(&key, value.into_bytes(), None);
                Ok(())
            }
        });
    }

    /// Best-effort delivery; failures are logged, never retried against the
    /// dedup store.
    async fn send_reply(&self, reply: &Reply) {
        if let Err(err) = self.reply_channel.send(reply).await {
            warn!(
                event_id = %reply.event_id,
                error = %err,
                "reply delivery failed; outcome already recorded"
            );
            counter!("reply_delivery_failures").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        CachesConfig, DedupConfig, PoolConfig, RetryConfig, TasksConfig,
    };
    use crate::pipeline::processor::{Processor, ProcessorKind};
    use crate::pipeline::reply::MemoryReplyChannel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct TestFactory;

    #[async_trait]
    impl ConnectionFactory for TestFactory {
        type Conn = ();

        async fn connect(&self) -> PipelineResult<()> {
            Ok(())
        }

        async fn validate(&self, _conn: &mut ()) -> bool {
            true
        }
    }

    /// Processor that counts calls and fails the first `fail_first` of them
    /// with the given error.
    struct ScriptedProcessor {
        kind: ProcessorKind,
        calls: AtomicU32,
        fail_first: u32,
        failure: fn() -> PipelineError,
    }

    impl ScriptedProcessor {
        fn succeeding(kind: ProcessorKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicU32::new(0),
                fail_first: 0,
                failure: || PipelineError::internal("unused"),
            })
        }

        fn failing(kind: ProcessorKind, fail_first: u32, failure: fn() -> PipelineError) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicU32::new(0),
                fail_first,
                failure,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Processor<()> for ScriptedProcessor {
        fn kind(&self) -> ProcessorKind {
            self.kind
        }

        async fn process(
            &self,
            event: &InboundEvent,
            _conn: &mut (),
        ) -> PipelineResult<ProcessorOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err((self.failure)());
            }
            Ok(ProcessorOutput::text_only(format!(
                "answer for {}",
                event.event_id
            )))
        }
    }

    struct Harness {
        coordinator: PipelineCoordinator<TestFactory>,
        nlp: Arc<ScriptedProcessor>,
        replies: Arc<MemoryReplyChannel>,
        pool: Arc<ConnectionPool<TestFactory>>,
        tasks: Arc<TaskRunner>,
        dedup: Arc<DedupStore>,
        caches: Arc<CacheRegistry>,
    }

    fn harness_with(nlp: Arc<ScriptedProcessor>) -> Harness {
        let dedup = Arc::new(DedupStore::new(DedupConfig {
            retention: Duration::from_secs(60),
            max_entries: 1000,
            fail_open: true,
        }));
        let caches = Arc::new(CacheRegistry::new(&CachesConfig::default()));
        let pool = Arc::new(ConnectionPool::new(
            TestFactory,
            PoolConfig {
                min_size: 0,
                max_size: 2,
                acquire_timeout: Duration::from_millis(200),
                stale_after: Duration::from_secs(60),
            },
        ));
        let tasks = TaskRunner::new(TasksConfig {
            queue_capacity: 32,
            workers: 1,
            max_attempts: 1,
            retry_base_delay: Duration::from_millis(1),
            overflow: crate::core::config::OverflowPolicy::Reject,
        });
        let replies = Arc::new(MemoryReplyChannel::new());
        let processors = ProcessorSet::new(
            nlp.clone(),
            ScriptedProcessor::succeeding(ProcessorKind::Image),
            ScriptedProcessor::succeeding(ProcessorKind::Chat),
        );
        let retry = RetryPolicy::new(&RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: false,
        });

        let coordinator = PipelineCoordinator::new(
            dedup.clone(),
            caches.clone(),
            pool.clone(),
            tasks.clone(),
            processors,
            replies.clone(),
            retry,
        );

        Harness {
            coordinator,
            nlp,
            replies,
            pool,
            tasks,
            dedup,
            caches,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedProcessor::succeeding(ProcessorKind::Nlp))
    }

    fn text_event(event_id: &str, text: &str) -> InboundEvent {
        InboundEvent::new(
            event_id.to_string(),
            1_700_000_000_000,
            "room-1".to_string(),
            EventPayload::Text {
                user_id: "u-1".to_string(),
                text: text.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let h = harness();

        let first = h
            .coordinator
            .handle_event(text_event("e-1", "how many calories in rice"))
            .await
            .unwrap();
        assert_eq!(first.source, ReplySource::Processor);

        // Different delivery, same question: served from cache.
        let second = h
            .coordinator
            .handle_event(text_event("e-2", "how many calories in rice"))
            .await
            .unwrap();
        assert_eq!(second.source, ReplySource::Cache);
        assert_eq!(second.text, first.text);
        assert_eq!(h.nlp.calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_processed_once() {
        let h = harness();
        let event = text_event("e-dup", "hello");

        let first = h.coordinator.handle_event(event.clone()).await.unwrap();
        assert_eq!(first.source, ReplySource::Processor);

        let second = h.coordinator.handle_event(event).await.unwrap();
        assert_eq!(second.source, ReplySource::Duplicate);
        assert!(second.text.is_empty());
        assert_eq!(h.nlp.calls(), 1);

        // The duplicate produced no outbound reply.
        assert_eq!(h.replies.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_to_success() {
        let h = harness_with(ScriptedProcessor::failing(
            ProcessorKind::Nlp,
            2,
            || PipelineError::connection("blip"),
        ));

        let reply = h
            .coordinator
            .handle_event(text_event("e-r", "flaky question"))
            .await
            .unwrap();
        assert_eq!(reply.source, ReplySource::Processor);
        assert_eq!(h.nlp.calls(), 3);
    }

    #[tokio::test]
    async fn test_hard_failure_yields_fallback_and_completes() {
        let h = harness_with(ScriptedProcessor::failing(
            ProcessorKind::Nlp,
            u32::MAX,
            || PipelineError::processor("nlp", "model exploded"),
        ));
        let event = text_event("e-f", "doomed question");

        let reply = h.coordinator.handle_event(event.clone()).await.unwrap();
        assert_eq!(reply.source, ReplySource::Fallback);
        assert!(!reply.text.contains("exploded"));
        // Hard downstream failures are not retried within the request.
        assert_eq!(h.nlp.calls(), 1);

        // complete() ran before responding: the redelivery sees Completed.
        let redelivery = h.coordinator.handle_event(event).await.unwrap();
        assert_eq!(redelivery.source, ReplySource::Duplicate);
        assert_eq!(h.nlp.calls(), 1);
    }

    #[tokio::test]
    async fn test_pool_returns_to_baseline_after_failure() {
        let h = harness_with(ScriptedProcessor::failing(
            ProcessorKind::Nlp,
            u32::MAX,
            || PipelineError::processor("nlp", "boom"),
        ));

        h.coordinator
            .handle_event(text_event("e-p", "question"))
            .await
            .unwrap();

        let stats = h.pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_discarded_on_connection_error() {
        let h = harness_with(ScriptedProcessor::failing(
            ProcessorKind::Nlp,
            1,
            || PipelineError::connection("socket died"),
        ));

        let reply = h
            .coordinator
            .handle_event(text_event("e-b", "question"))
            .await
            .unwrap();
        assert_eq!(reply.source, ReplySource::Processor);

        // The attempt that hit the connection error surrendered its
        // connection instead of pooling it.
        let stats = h.pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_stale_entry_served_while_degraded() {
        let h = harness_with(ScriptedProcessor::failing(
            ProcessorKind::Nlp,
            u32::MAX,
            || PipelineError::processor("nlp", "down"),
        ));

        // A previously computed answer, now past its TTL but not yet swept.
        let key = keys::nlp_key("what did i eat");
        let old = serde_json::to_vec(&ProcessorOutput::text_only("yesterday's answer")).unwrap();
        h.caches.nlp.put(&key, old, Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let reply = h
            .coordinator
            .handle_event(text_event("e-s", "what did i eat"))
            .await
            .unwrap();
        assert_eq!(reply.source, ReplySource::StaleCache);
        assert_eq!(reply.text, "yesterday's answer");
    }

    #[tokio::test]
    async fn test_unknown_event_kind_gets_fallback() {
        let h = harness();
        let event = InboundEvent::new(
            "e-u".to_string(),
            1,
            "room-1".to_string(),
            EventPayload::Unknown {
                kind: "sticker".to_string(),
            },
        );

        let reply = h.coordinator.handle_event(event).await.unwrap();
        assert_eq!(reply.source, ReplySource::Fallback);
        assert_eq!(h.nlp.calls(), 0);
    }

    #[tokio::test]
    async fn test_session_refreshed_off_the_reply_path() {
        let h = harness();

        h.coordinator
            .handle_event(text_event("e-sess", "hello"))
            .await
            .unwrap();

        h.tasks.drain(Duration::from_secs(1)).await.unwrap();
        let session = h.caches.session.get(&keys::session_key("u-1"));
        assert!(session.is_some());
    }

    #[tokio::test]
    async fn test_follow_event_skips_caches() {
        let h = harness();
        let event = InboundEvent::new(
            "e-follow".to_string(),
            1,
            "room-1".to_string(),
            EventPayload::Follow {
                user_id: "u-9".to_string(),
            },
        );

        let reply = h.coordinator.handle_event(event.clone()).await.unwrap();
        assert_eq!(reply.source, ReplySource::Processor);
        assert!(h.caches.nlp.is_empty());
        assert!(h.caches.image.is_empty());

        // Not cached, but still deduplicated.
        let again = h.coordinator.handle_event(event).await.unwrap();
        assert_eq!(again.source, ReplySource::Duplicate);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_one_winner() {
        let h = Arc::new(harness());
        let event = text_event("e-race", "race question");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let h = h.clone();
            let event = event.clone();
            handles.push(tokio::spawn(async move {
                h.coordinator.handle_event(event).await.unwrap()
            }));
        }

        let mut processed = 0;
        for handle in handles {
            let reply = handle.await.unwrap();
            if reply.source != ReplySource::Duplicate {
                processed += 1;
            }
        }
        assert_eq!(processed, 1);
        assert_eq!(h.nlp.calls(), 1);
        let (_, duplicates, _) = h.dedup.counters();
        assert_eq!(duplicates, 7);
    }
}
