use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use relay_core::config::EngineConfig;
use relay_core::error::{RelayError, Result};
use relay_core::types::Output;

use crate::flow::{self, ExecCtx, Flow, FlowBase};
use crate::stage::Stage;

/// Concurrency-bounded parallel executor.
///
/// Stages are independent: none sees another's result. Results come back
/// in declaration order whatever order the calls complete in. The first
/// failure rejects the batch at once. Units already in flight are not
/// cancelled: they run their whole pipeline in the background and their
/// outcomes are discarded.
#[derive(Default)]
pub struct Batch {
    base: FlowBase,
    concurrency: Option<usize>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch that follows the `[engine]` config section.
    pub fn from_engine_config(config: &EngineConfig) -> Result<Self> {
        let batch = Self::new().with_engine_config(config);
        match config.default_concurrency {
            Some(limit) => batch.with_concurrency(limit),
            None => Ok(batch),
        }
    }

    /// Admit at most `limit` stages at once. Zero or negative limits are
    /// rejected.
    pub fn with_concurrency(mut self, limit: i64) -> Result<Self> {
        self.set_concurrency(limit)?;
        Ok(self)
    }

    pub fn set_concurrency(&mut self, limit: i64) -> Result<()> {
        if limit <= 0 {
            return Err(RelayError::InvalidConcurrency(limit));
        }
        let limit = usize::try_from(limit).map_err(|_| RelayError::InvalidConcurrency(limit))?;
        self.concurrency = Some(limit);
        Ok(())
    }

    /// Remove the ceiling; every stage starts immediately.
    pub fn unbounded(mut self) -> Self {
        self.concurrency = None;
        self
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    /// Run every stage whose precondition holds and return the results in
    /// declaration order.
    pub async fn execute(&self) -> Result<Vec<Output>> {
        let ctx = ExecCtx::root(&self.base);
        self.run_all(&ctx).await
    }

    pub async fn execute_all(&self) -> Result<Vec<Output>> {
        self.execute().await
    }

    /// Like [`execute`](Self::execute), but for a batch whose produced
    /// result count is known up front.
    pub async fn execute_array<const N: usize>(&self) -> Result<[Output; N]> {
        let results = self.execute().await?;
        <[Output; N]>::try_from(results).map_err(|results| {
            RelayError::Pipeline(format!(
                "expected {} batch results, got {}",
                N,
                results.len()
            ))
        })
    }

    pub(crate) async fn run_all(&self, ctx: &ExecCtx) -> Result<Vec<Output>> {
        let outcome = self.drive(ctx).await;
        match &outcome {
            Ok(results) if !results.is_empty() => {
                let aggregate = Output::List(results.clone());
                self.base.handlers.settle(Ok(Some(&aggregate)));
            }
            Ok(_) => self.base.handlers.settle(Ok(None)),
            Err(e) => self.base.handlers.settle(Err(e)),
        }
        outcome
    }

    async fn drive(&self, ctx: &ExecCtx) -> Result<Vec<Output>> {
        let stages = &self.base.stages;
        let survivors: Vec<(usize, &Stage)> = stages
            .iter()
            .enumerate()
            .filter(|(index, stage)| {
                let run = stage.hooks().should_run();
                if !run {
                    flow::log_skip(*index, stage);
                }
                run
            })
            .collect();

        let limit = self.concurrency.unwrap_or(survivors.len()).max(1);
        info!(
            execution_id = %ctx.execution_id,
            depth = ctx.depth,
            stages = stages.len(),
            runnable = survivors.len(),
            concurrency = limit,
            "Executing batch"
        );

        let mut queue = survivors.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for (index, stage) in queue.by_ref().take(limit) {
            in_flight.push(admit(index, stage, ctx));
        }

        let mut done: Vec<(usize, Output)> = Vec::new();
        while let Some(joined) = in_flight.next().await {
            let settled = joined
                .map_err(|e| RelayError::Pipeline(format!("batch unit aborted: {}", e)))
                .and_then(|settled| settled);
            match settled {
                Ok(pair) => {
                    done.push(pair);
                    if let Some((index, stage)) = queue.next() {
                        debug!(stage = index, in_flight = in_flight.len(), "Admitting stage");
                        in_flight.push(admit(index, stage, ctx));
                    }
                }
                Err(e) => {
                    // Dropping a JoinHandle detaches the task; it keeps running.
                    if !in_flight.is_empty() {
                        debug!(detached = in_flight.len(), "Batch failed, ignoring in-flight stages");
                    }
                    self.record(&done);
                    return Err(e);
                }
            }
        }

        done.sort_by_key(|(index, _)| *index);
        self.record(&done);
        info!(
            execution_id = %ctx.execution_id,
            produced = done.len(),
            "Batch complete"
        );
        Ok(done.into_iter().map(|(_, output)| output).collect())
    }

    fn record(&self, done: &[(usize, Output)]) {
        let mut slots = vec![None; self.base.stages.len()];
        for (index, output) in done {
            slots[*index] = Some(output.clone());
        }
        self.base.record(slots);
    }
}

/// Start one stage as its own task so a rejected batch never cancels it.
fn admit(index: usize, stage: &Stage, ctx: &ExecCtx) -> JoinHandle<Result<(usize, Output)>> {
    let stage = stage.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        flow::run_stage(&stage, index, None, &ctx)
            .await
            .map(|output| (index, output))
    })
}

impl Flow for Batch {
    fn base(&self) -> &FlowBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut FlowBase {
        &mut self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use relay_core::types::RequestConfig;
    use relay_test_utils::MockAdapter;
    use serde_json::json;

    use crate::stage::{RequestStage, StageExt};

    fn delayed_adapter(delays_ms: &[u64]) -> Arc<MockAdapter> {
        let mut adapter = MockAdapter::new();
        for (i, ms) in delays_ms.iter().enumerate() {
            adapter = adapter.with_delay(format!("https://api.test/{}", i), Duration::from_millis(*ms));
        }
        Arc::new(adapter)
    }

    fn batch_of(n: usize, adapter: Arc<MockAdapter>) -> Batch {
        (0..n).fold(Batch::new().with_adapter(adapter), |batch, i| {
            batch.add_stage(RequestConfig::get(format!("https://api.test/{}", i)))
        })
    }

    fn targets(results: &[Output]) -> Vec<String> {
        results
            .iter()
            .map(|r| r.as_json().unwrap()["target"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_declaration_order() {
        let delays = [30, 10, 20, 5];
        let expected: Vec<String> = (0..4).map(|i| format!("https://api.test/{}", i)).collect();

        for ceiling in [None, Some(1), Some(2), Some(3), Some(4)] {
            let mut batch = batch_of(4, delayed_adapter(&delays));
            if let Some(c) = ceiling {
                batch = batch.with_concurrency(c).unwrap();
            }
            let results = batch.execute().await.unwrap();
            assert_eq!(targets(&results), expected, "ceiling {:?}", ceiling);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_bounds_in_flight_calls() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let adapter = MockAdapter::new().handler_async(move |config| {
            let a = a.clone();
            let p = p.clone();
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(Output::Text(config.target))
            }
        });

        let batch = batch_of(6, Arc::new(adapter)).with_concurrency(2).unwrap();
        let results = batch.execute().await.unwrap();
        assert_eq!(results.len(), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn non_positive_concurrency_is_rejected() {
        for bad in [0, -1] {
            match Batch::new().with_concurrency(bad) {
                Err(RelayError::InvalidConcurrency(n)) => assert_eq!(n, bad),
                _ => panic!("expected InvalidConcurrency for {}", bad),
            }
        }
    }

    #[tokio::test]
    async fn empty_batch_never_fires_result_handler() {
        let fired = Arc::new(Mutex::new(false));
        let finished = Arc::new(Mutex::new(false));
        let (f, d) = (fired.clone(), finished.clone());
        let batch = Batch::new()
            .on_result(move |_| *f.lock().unwrap() = true)
            .on_finish(move || *d.lock().unwrap() = true);

        assert!(batch.execute().await.unwrap().is_empty());
        assert!(!*fired.lock().unwrap());
        assert!(*finished.lock().unwrap());
    }

    #[tokio::test]
    async fn skipped_stages_are_excluded() {
        let adapter = Arc::new(MockAdapter::new());
        let batch = Batch::new()
            .with_adapter(adapter.clone())
            .add_stage(RequestConfig::get("https://api.test/0"))
            .add_stage(RequestStage::new(RequestConfig::get("https://api.test/1")).when(|| false))
            .add_stage(RequestConfig::get("https://api.test/2"));

        let results = batch.execute().await.unwrap();
        assert_eq!(targets(&results), vec!["https://api.test/0", "https://api.test/2"]);
        assert_eq!(adapter.call_count(), 2);
        assert_eq!(batch.stage_results()[1], None);
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_rejects_without_cancelling_in_flight() {
        let intercepted = Arc::new(AtomicUsize::new(0));
        let i = intercepted.clone();
        let slow_done = Arc::new(AtomicUsize::new(0));
        let s = slow_done.clone();
        let adapter = MockAdapter::new().handler_async(move |config| {
            let s = s.clone();
            async move {
                if config.target.ends_with("/bad") {
                    return Err(RelayError::http_status(500, "boom"));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                s.fetch_add(1, Ordering::SeqCst);
                Ok(Output::Text(config.target))
            }
        });

        let batch = Batch::new()
            .with_adapter(Arc::new(adapter))
            .add_stage(
                RequestStage::new(RequestConfig::get("https://api.test/slow")).intercept(move |_| {
                    i.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .add_stage(RequestConfig::get("https://api.test/bad"));

        let err = batch.execute().await.unwrap_err();
        assert_eq!(err.stage_index(), Some(1));
        assert_eq!(err.status(), Some(500));
        assert_eq!(slow_done.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(slow_done.load(Ordering::SeqCst), 1);
        assert_eq!(intercepted.load(Ordering::SeqCst), 1);
        assert_eq!(batch.stage_results(), vec![None, None]);
    }

    #[tokio::test]
    async fn failing_stage_reports_config_before_flow_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen_config = Arc::new(Mutex::new(None));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let cfg = seen_config.clone();
        let adapter = MockAdapter::new().fail_target("https://api.test/1", 1, || {
            RelayError::http_status(502, "bad gateway")
        });
        let failing = RequestConfig::post("https://api.test/1", json!({"n": 1})).with_header("x-id", "7");

        let batch = Batch::new()
            .with_adapter(Arc::new(adapter))
            .add_stage(RequestConfig::get("https://api.test/0"))
            .add_stage(RequestStage::new(failing.clone()).on_error(move |e| {
                *cfg.lock().unwrap() = e.request_config().cloned();
                a.lock().unwrap().push("stage");
            }))
            .on_error(move |_| b.lock().unwrap().push("flow"))
            .on_finish(move || c.lock().unwrap().push("finish"));

        let err = batch.execute().await.unwrap_err();
        assert_eq!(err.request_config(), Some(&failing));
        assert_eq!(seen_config.lock().unwrap().as_ref(), Some(&failing));
        assert_eq!(*log.lock().unwrap(), vec!["stage", "flow", "finish"]);
    }

    #[tokio::test]
    async fn execute_array_checks_arity() {
        let batch = batch_of(2, Arc::new(MockAdapter::new()));
        let [a, b] = batch.execute_array::<2>().await.unwrap();
        assert_eq!(a.as_json().unwrap()["target"], json!("https://api.test/0"));
        assert_eq!(b.as_json().unwrap()["target"], json!("https://api.test/1"));

        let err = batch.execute_array::<3>().await.unwrap_err();
        assert!(matches!(err, RelayError::Pipeline(_)));
    }

    #[test]
    fn engine_config_supplies_default_ceiling() {
        let config = EngineConfig {
            max_nesting_depth: 4,
            default_concurrency: Some(3),
        };
        let batch = Batch::from_engine_config(&config).unwrap();
        assert_eq!(batch.concurrency(), Some(3));

        let bad = EngineConfig {
            default_concurrency: Some(0),
            ..config
        };
        assert!(Batch::from_engine_config(&bad).is_err());
    }
}
