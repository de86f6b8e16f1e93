//! Shared test utilities, mocks, and fixtures for Relay crates.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use relay_core::error::{RelayError, Result};
use relay_core::traits::Adapter;
use relay_core::types::{ByteStream, Output, RequestConfig, Response};

type Fail = Arc<dyn Fn() -> RelayError + Send + Sync>;
type Handler = Arc<dyn Fn(RequestConfig) -> BoxFuture<'static, Result<Output>> + Send + Sync>;

/// One scripted outcome.
#[derive(Clone)]
enum Step {
    /// Answer with the request config serialized as JSON.
    Echo,
    Respond(Output),
    Stream(Vec<Bytes>),
    Fail(Fail),
    Handler(Handler),
}

#[derive(Default)]
struct Script {
    queue: VecDeque<Step>,
    by_target: HashMap<String, VecDeque<Step>>,
    fallback: Option<Step>,
}

impl Script {
    fn next(&mut self, target: &str) -> Step {
        if let Some(step) = self.by_target.get_mut(target).and_then(|q| q.pop_front()) {
            return step;
        }
        if let Some(step) = self.queue.pop_front() {
            return step;
        }
        self.fallback.clone().unwrap_or(Step::Echo)
    }
}

/// Scripted in-memory adapter.
///
/// Outcomes are taken from the per-target queue first, then the shared
/// queue, then the fallback (echo of the request config by default).
/// Every call is logged.
#[derive(Default)]
pub struct MockAdapter {
    script: Mutex<Script>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<RequestConfig>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, step: Step) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.queue.push_back(step);
        }
        self
    }

    fn fallback(self, step: Step) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.fallback = Some(step);
        }
        self
    }

    /// Answer every unscripted call with `value`.
    pub fn respond_json(self, value: serde_json::Value) -> Self {
        self.fallback(Step::Respond(Output::Json(value)))
    }

    pub fn respond_text(self, text: impl Into<String>) -> Self {
        self.fallback(Step::Respond(Output::Text(text.into())))
    }

    pub fn respond(self, output: Output) -> Self {
        self.fallback(Step::Respond(output))
    }

    /// Answer every unscripted call with a streaming body split into `parts`.
    pub fn respond_stream(self, parts: &[&str]) -> Self {
        let parts = parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect();
        self.fallback(Step::Stream(parts))
    }

    /// Fail every unscripted call with the error `f` builds.
    pub fn fail_with<F>(self, f: F) -> Self
    where
        F: Fn() -> RelayError + Send + Sync + 'static,
    {
        self.fallback(Step::Fail(Arc::new(f)))
    }

    /// Compute every unscripted answer from the request config.
    pub fn handler<F>(self, f: F) -> Self
    where
        F: Fn(&RequestConfig) -> Result<Output> + Send + Sync + 'static,
    {
        self.handler_async(move |config| {
            let out = f(&config);
            async move { out }
        })
    }

    pub fn handler_async<F, Fut>(self, f: F) -> Self
    where
        F: Fn(RequestConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output>> + Send + 'static,
    {
        self.fallback(Step::Handler(Arc::new(move |config| Box::pin(f(config)))))
    }

    /// Queue one JSON answer.
    pub fn then_json(self, value: serde_json::Value) -> Self {
        self.push(Step::Respond(Output::Json(value)))
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.push(Step::Respond(Output::Text(text.into())))
    }

    /// Queue one failure.
    pub fn then_err(self, err: RelayError) -> Self {
        self.push(Step::Fail(Arc::new(move || err.clone())))
    }

    /// Queue `n` failures built by `f`.
    pub fn fail_times<F>(mut self, n: usize, f: F) -> Self
    where
        F: Fn() -> RelayError + Send + Sync + 'static,
    {
        let f: Fail = Arc::new(f);
        for _ in 0..n {
            self = self.push(Step::Fail(f.clone()));
        }
        self
    }

    /// Fail the first `n` calls to `target`.
    pub fn fail_target<F>(self, target: impl Into<String>, n: usize, f: F) -> Self
    where
        F: Fn() -> RelayError + Send + Sync + 'static,
    {
        let f: Fail = Arc::new(f);
        if let Ok(mut script) = self.script.lock() {
            let queue = script.by_target.entry(target.into()).or_default();
            queue.extend(std::iter::repeat(Step::Fail(f)).take(n));
        }
        self
    }

    /// Sleep for `delay` before answering calls to `target`.
    pub fn with_delay(mut self, target: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(target.into(), delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Configs received so far, in call order.
    pub fn calls(&self) -> Vec<RequestConfig> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn execute_request<'a>(&'a self, config: &'a RequestConfig) -> BoxFuture<'a, Result<Response>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(config.clone());
        }
        let step = self
            .script
            .lock()
            .map(|mut s| s.next(&config.target))
            .unwrap_or(Step::Echo);
        let delay = self.delays.get(&config.target).copied();

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match step {
                Step::Echo => Ok(Response::complete(serde_json::to_value(config)?).with_status(200)),
                Step::Respond(output) => Ok(Response::complete(output).with_status(200)),
                Step::Stream(parts) => Ok(Response::streaming(stream_of(parts)).with_status(200)),
                Step::Fail(f) => Err(f()),
                Step::Handler(h) => Ok(Response::complete(h(config.clone()).await?)),
            }
        })
    }
}

fn stream_of(parts: Vec<Bytes>) -> ByteStream {
    Box::pin(futures::stream::iter(parts.into_iter().map(Ok)))
}

/// A byte stream yielding each string as one chunk.
pub fn chunked(parts: &[&str]) -> ByteStream {
    stream_of(parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect())
}

/// A byte stream yielding each slice as one chunk.
pub fn chunked_bytes(parts: &[&[u8]]) -> ByteStream {
    stream_of(parts.iter().map(|p| Bytes::copy_from_slice(p)).collect())
}
