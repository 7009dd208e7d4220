//! Request Dispatcher
//!
//! Takes an OpenAI-style completion, makes sure the named model is serving
//! and forwards the request to its engine. Streaming callers see status
//! events while the model loads. Every path out of a request (success,
//! failure, timeout, client disconnect) drops the instance lease exactly once.

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::lifecycle::{EnsureOptions, LifecycleManager, LoadProgress};
use crate::model_runtime::ChatCompletionRequest;
use crate::stats::{ActivityEvent, StatsCollector};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Covers the wait for readiness plus the engine's answer
    pub request_timeout: Duration,
    /// Cadence of status events sent to streaming callers during a load
    pub status_interval: Duration,
    /// `auto_unload` flag for loads triggered by a completion request
    pub auto_unload: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(600),
            status_interval: Duration::from_secs(2),
            auto_unload: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Model is still resolving, downloading or starting
    Status(LoadProgress),
    /// One `data:` payload from the engine, forwarded untouched
    Data(String),
    /// Terminal failure; nothing follows it
    Error(GatewayError),
    Done,
}

pub struct Dispatcher {
    lifecycle: Arc<LifecycleManager>,
    stats: StatsCollector,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(lifecycle: Arc<LifecycleManager>, stats: StatsCollector, config: DispatcherConfig) -> Self {
        Self {
            lifecycle,
            stats,
            config,
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    fn ensure_options(&self) -> EnsureOptions {
        EnsureOptions {
            auto_unload: self.config.auto_unload,
            ..EnsureOptions::default()
        }
    }

    fn timed_out(&self, model: &str) -> GatewayError {
        GatewayError::RequestTimeout(format!(
            "{} did not answer within {}s",
            model,
            self.config.request_timeout.as_secs()
        ))
    }

    /// Blocking completion: waits for readiness, then for the whole answer.
    pub async fn complete(&self, request: ChatCompletionRequest) -> Result<Value> {
        let model = requested_model(&request)?;
        let deadline = Instant::now() + self.config.request_timeout;

        let lease = timeout_at(deadline, self.lifecycle.ensure_ready(&model, self.ensure_options()))
            .await
            .map_err(|_| self.timed_out(&model))??;

        let mut recorder = CompletionRecorder::start(self.stats.clone(), lease.identifier());
        let result = match timeout_at(deadline, lease.runtime().generate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(&model)),
        };
        match &result {
            Ok(body) => {
                recorder.observe(body);
                recorder.succeed();
            }
            Err(e) => warn!("Completion on {} failed: {}", lease.identifier(), e),
        }
        drop(recorder);
        lease.release();
        result
    }

    /// Streaming completion. The returned stream is lazy: nothing happens
    /// until it is polled, and dropping it cancels the request.
    pub fn stream(self: &Arc<Self>, request: ChatCompletionRequest) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let dispatcher = self.clone();
        async_stream::stream! {
            let model = match requested_model(&request) {
                Ok(model) => model,
                Err(e) => {
                    yield StreamEvent::Error(e);
                    return;
                }
            };
            let deadline = Instant::now() + dispatcher.config.request_timeout;

            let ensure = dispatcher.lifecycle.ensure_ready(&model, dispatcher.ensure_options());
            tokio::pin!(ensure);
            let mut ticker = tokio::time::interval(dispatcher.config.status_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let lease = loop {
                let step = tokio::select! {
                    biased;
                    result = &mut ensure => WaitStep::Finished(result),
                    _ = tokio::time::sleep_until(deadline) => WaitStep::TimedOut,
                    _ = ticker.tick() => WaitStep::Tick,
                };
                match step {
                    WaitStep::Finished(Ok(lease)) => break lease,
                    WaitStep::Finished(Err(e)) => {
                        yield StreamEvent::Error(e);
                        return;
                    }
                    WaitStep::TimedOut => {
                        yield StreamEvent::Error(dispatcher.timed_out(&model));
                        return;
                    }
                    WaitStep::Tick => {
                        if let Some(progress) = dispatcher.lifecycle.progress(&model) {
                            if progress.state.is_loading() {
                                yield StreamEvent::Status(progress);
                            }
                        }
                    }
                }
            };

            debug!("Streaming from {}", lease.identifier());
            let mut recorder = CompletionRecorder::start(dispatcher.stats.clone(), lease.identifier());
            let mut upstream = match timeout_at(deadline, lease.runtime().generate_stream(&request)).await {
                Ok(Ok(upstream)) => upstream,
                Ok(Err(e)) => {
                    yield StreamEvent::Error(e);
                    return;
                }
                Err(_) => {
                    yield StreamEvent::Error(dispatcher.timed_out(&model));
                    return;
                }
            };

            loop {
                match timeout_at(deadline, upstream.next()).await {
                    Ok(Some(Ok(chunk))) => {
                        recorder.observe_chunk(&chunk);
                        yield StreamEvent::Data(chunk);
                    }
                    Ok(Some(Err(e))) => {
                        warn!("Stream from {} failed: {}", lease.identifier(), e);
                        yield StreamEvent::Error(e);
                        return;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        yield StreamEvent::Error(dispatcher.timed_out(&model));
                        return;
                    }
                }
            }

            recorder.succeed();
            drop(recorder);
            lease.release();
            yield StreamEvent::Done;
        }
    }
}

enum WaitStep<T> {
    Finished(Result<T>),
    TimedOut,
    Tick,
}

fn requested_model(request: &ChatCompletionRequest) -> Result<String> {
    let model = request.model.trim();
    if model.is_empty() {
        return Err(GatewayError::InvalidRequest("model is required".into()));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest("messages cannot be empty".into()));
    }
    Ok(model.to_string())
}

/// Reads `usage.prompt_tokens` / `usage.completion_tokens` from an engine
/// response or stream chunk.
pub fn parse_usage(body: &Value) -> Option<(u64, u64)> {
    let usage = body.get("usage")?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let completion = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
    Some((prompt, completion))
}

/// Records `RequestStarted` on creation and `RequestCompleted` on drop, so a
/// canceled stream is still counted, as a failure.
struct CompletionRecorder {
    stats: StatsCollector,
    identifier: String,
    started: std::time::Instant,
    prompt_tokens: u64,
    completion_tokens: u64,
    success: bool,
}

impl CompletionRecorder {
    fn start(stats: StatsCollector, identifier: &str) -> Self {
        stats.record(identifier, ActivityEvent::RequestStarted);
        Self {
            stats,
            identifier: identifier.to_string(),
            started: std::time::Instant::now(),
            prompt_tokens: 0,
            completion_tokens: 0,
            success: false,
        }
    }

    fn observe(&mut self, body: &Value) {
        if let Some((prompt, completion)) = parse_usage(body) {
            self.prompt_tokens = prompt;
            self.completion_tokens = completion;
        }
    }

    fn observe_chunk(&mut self, chunk: &str) {
        if !chunk.contains("\"usage\"") {
            return;
        }
        if let Ok(body) = serde_json::from_str::<Value>(chunk) {
            self.observe(&body);
        }
    }

    fn succeed(&mut self) {
        self.success = true;
    }
}

impl Drop for CompletionRecorder {
    fn drop(&mut self) {
        let duration = self.started.elapsed();
        if !self.success {
            info!("Request on {} ended early after {:?}", self.identifier, duration);
        }
        self.stats.record(
            &self.identifier,
            ActivityEvent::RequestCompleted {
                duration,
                prompt_tokens: self.prompt_tokens,
                completion_tokens: self.completion_tokens,
                success: self.success,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{InstanceState, LifecycleConfig};
    use crate::testing::Harness;
    use serde_json::json;

    fn chat(model: &str) -> ChatCompletionRequest {
        serde_json::from_value(json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2
        }))
        .unwrap()
    }

    fn dispatcher(h: &Harness, config: DispatcherConfig) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(h.manager.clone(), h.stats.clone(), config))
    }

    fn fast() -> DispatcherConfig {
        DispatcherConfig {
            request_timeout: Duration::from_secs(5),
            status_interval: Duration::from_millis(20),
            auto_unload: true,
        }
    }

    #[tokio::test]
    async fn test_complete_loads_forwards_and_records_usage() {
        let mut h = Harness::new(&[1000], LifecycleConfig::default()).await;
        h.add_model("org/a", "a.Q4_K_M.gguf", 100).await;
        let d = dispatcher(&h, fast());

        let body = d.complete(chat("org/a")).await.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "ok");

        let summary = &h.manager.list()[0];
        assert_eq!(summary.ref_count, 0);
        assert_eq!(summary.state, InstanceState::Ready);
        assert!(summary.auto_unload);

        h.stats.flush().await;
        let snap = h.stats.snapshot();
        let a = snap.get("org/a").unwrap();
        assert_eq!(a.requests_started, 1);
        assert_eq!(a.requests_completed, 1);
        assert_eq!(a.prompt_tokens, 3);
        assert_eq!(a.completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_invalid_model_rejected_before_any_work() {
        let h = Harness::new(&[1000], LifecycleConfig::default()).await;
        let d = dispatcher(&h, fast());

        let err = d.complete(chat("not a valid id!")).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_identifier");
        let err = d.complete(chat("  ")).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert_eq!(h.registry.list_calls(), 0);
        assert!(h.manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_complete_times_out_while_loading() {
        let mut h = Harness::new(&[1000], LifecycleConfig::default()).await;
        h.add_model("org/a", "a.Q4_K_M.gguf", 100).await;
        h.launcher.set_delay(Duration::from_millis(500));
        let d = dispatcher(
            &h,
            DispatcherConfig {
                request_timeout: Duration::from_millis(100),
                ..fast()
            },
        );

        let err = d.complete(chat("org/a")).await.unwrap_err();
        assert_eq!(err.kind(), "request_timeout");
    }

    #[tokio::test]
    async fn test_stream_reports_status_then_data_then_done() {
        let mut h = Harness::new(&[1000], LifecycleConfig::default()).await;
        h.add_model("org/a", "a.Q4_K_M.gguf", 100).await;
        h.launcher.set_delay(Duration::from_millis(150));
        let d = dispatcher(&h, fast());

        let events: Vec<StreamEvent> = d.stream(chat("org/a")).collect().await;

        assert!(matches!(events.first(), Some(StreamEvent::Status(_))));
        let data: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Data(chunk) => Some(chunk),
                _ => None,
            })
            .collect();
        assert_eq!(data.len(), 2);
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
        assert_eq!(h.manager.list()[0].ref_count, 0);

        h.stats.flush().await;
        let a = h.stats.snapshot().get("org/a").cloned().unwrap();
        assert_eq!(a.requests_completed, 1);
        assert_eq!(a.prompt_tokens, 4);
        assert_eq!(a.completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_reference() {
        let mut h = Harness::new(&[1000], LifecycleConfig::default()).await;
        h.add_model("org/a", "a.Q4_K_M.gguf", 100).await;
        h.launcher.set_stream(
            (0..10).map(|i| format!(r#"{{"n":{}}}"#, i)).collect(),
            Duration::from_millis(50),
        );
        let d = dispatcher(&h, fast());

        let mut stream = Box::pin(d.stream(chat("org/a")));
        loop {
            match stream.next().await {
                Some(StreamEvent::Data(_)) => break,
                Some(StreamEvent::Status(_)) => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(h.manager.list()[0].ref_count, 1);

        drop(stream);
        let summary = &h.manager.list()[0];
        assert_eq!(summary.ref_count, 0);
        assert_eq!(summary.state, InstanceState::Ready);

        h.stats.flush().await;
        assert_eq!(h.stats.snapshot().get("org/a").unwrap().requests_failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_canceled_callers_return_reference_count_to_zero() {
        use rand::Rng;

        let mut h = Harness::new(&[1000], LifecycleConfig::default()).await;
        h.add_model("org/a", "a.Q4_K_M.gguf", 100).await;
        h.launcher.set_delay(Duration::from_millis(100));
        h.launcher.set_stream(
            (0..20).map(|i| format!(r#"{{"n":{}}}"#, i)).collect(),
            Duration::from_millis(10),
        );
        let d = dispatcher(&h, fast());

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let manager = h.manager.clone();
                let d = d.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        let lease = manager.ensure_ready("org/a", EnsureOptions::default()).await?;
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        drop(lease);
                    } else {
                        let _events: Vec<StreamEvent> = d.stream(chat("org/a")).collect().await;
                    }
                    Ok::<_, GatewayError>(())
                })
            })
            .collect();

        // One wave of aborts during the load, one while leases and streams are live.
        let (during_load, during_use): (Vec<bool>, Vec<bool>) = {
            let mut rng = rand::thread_rng();
            (0..tasks.len())
                .map(|_| (rng.gen_bool(0.3), rng.gen_bool(0.3)))
                .unzip()
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        for (task, abort) in tasks.iter().zip(&during_load) {
            if *abort {
                task.abort();
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        for (task, abort) in tasks.iter().zip(&during_use) {
            if *abort {
                task.abort();
            }
        }
        for task in tasks {
            if let Ok(result) = task.await {
                result.unwrap();
            }
        }

        let summary = &h.manager.list()[0];
        assert_eq!(summary.ref_count, 0);
        assert_eq!(summary.state, InstanceState::Ready);
        assert_eq!(h.launcher.starts(), 1);

        h.stats.flush().await;
        let activity = h.stats.snapshot().get("org/a").cloned().unwrap_or_default();
        assert_eq!(
            activity.requests_started,
            activity.requests_completed + activity.requests_failed
        );
    }

    #[tokio::test]
    async fn test_stream_ends_with_error_on_failed_load() {
        let mut h = Harness::new(&[1000], LifecycleConfig::default()).await;
        h.add_model("org/a", "a.Q4_K_M.gguf", 100).await;
        h.launcher
            .fail_next(GatewayError::InstanceStart("engine crashed".into()));
        let d = dispatcher(&h, fast());

        let events: Vec<StreamEvent> = d.stream(chat("org/a")).collect().await;
        match events.last() {
            Some(StreamEvent::Error(e)) => assert_eq!(e.kind(), "instance_start_error"),
            other => panic!("expected error, got {:?}", other),
        }
        assert!(h.manager.list().is_empty());
    }

    #[test]
    fn test_parse_usage() {
        assert_eq!(
            parse_usage(&json!({"usage": {"prompt_tokens": 7, "completion_tokens": 3}})),
            Some((7, 3))
        );
        assert_eq!(parse_usage(&json!({"choices": []})), None);
    }
}
