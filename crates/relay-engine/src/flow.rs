use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{debug, error};
use uuid::Uuid;

use relay_core::config::EngineConfig;
use relay_core::error::{RelayError, Result};
use relay_core::traits::Adapter;
use relay_core::types::{Output, RequestConfig};

use crate::batch::Batch;
use crate::chain::Chain;
use crate::retry;
use crate::stage::{RequestStage, Stage, StageHooks};

/// Fires with the final (chain) or aggregate (batch) result.
pub type ResultHandler = Arc<dyn Fn(&Output) + Send + Sync>;

/// Observes a failed execution. The error is still returned to the caller.
pub type ErrorHandler = Arc<dyn Fn(&RelayError) + Send + Sync>;

/// Runs once per execution, after every other handler.
pub type FinishHandler = Arc<dyn Fn() + Send + Sync>;

pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Flow-level lifecycle handlers.
#[derive(Clone, Default)]
pub struct FlowHandlers {
    pub on_result: Option<ResultHandler>,
    pub on_error: Option<ErrorHandler>,
    pub on_finish: Option<FinishHandler>,
}

impl FlowHandlers {
    /// Notify handlers of an execution outcome. `None` means nothing was
    /// produced and the result handler stays silent.
    pub(crate) fn settle(&self, outcome: std::result::Result<Option<&Output>, &RelayError>) {
        match outcome {
            Ok(Some(output)) => {
                if let Some(handler) = &self.on_result {
                    handler(output);
                }
            }
            Ok(None) => {}
            Err(e) => {
                if let Some(handler) = &self.on_error {
                    handler(e);
                }
            }
        }
        if let Some(handler) = &self.on_finish {
            handler();
        }
    }
}

/// State shared by chains and batches: the stage list, the adapter, the
/// handlers, and the result slots of the most recent execution.
pub struct FlowBase {
    pub(crate) stages: Vec<Stage>,
    pub(crate) adapter: Option<Arc<dyn Adapter>>,
    pub(crate) handlers: FlowHandlers,
    pub(crate) max_depth: usize,
    last_results: Mutex<Vec<Option<Output>>>,
}

impl Default for FlowBase {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            adapter: None,
            handlers: FlowHandlers::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            last_results: Mutex::new(Vec::new()),
        }
    }
}

impl FlowBase {
    /// Store the slots of a finished (or aborted) execution. Stages that
    /// never ran are recorded as `None`.
    pub(crate) fn record(&self, mut slots: Vec<Option<Output>>) {
        slots.resize(self.stages.len(), None);
        if let Ok(mut last) = self.last_results.lock() {
            *last = slots;
        }
    }

    fn snapshot(&self) -> Vec<Option<Output>> {
        match self.last_results.lock() {
            Ok(last) => last.clone(),
            Err(_) => Vec::new(),
        }
    }
}

/// Builder surface common to [`Chain`] and [`Batch`].
pub trait Flow: Sized {
    fn base(&self) -> &FlowBase;
    fn base_mut(&mut self) -> &mut FlowBase;

    /// Append a stage. Accepts anything convertible into a [`Stage`],
    /// including a bare [`RequestConfig`].
    fn add_stage(mut self, stage: impl Into<Stage>) -> Self {
        self.base_mut().stages.push(stage.into());
        self
    }

    /// Append a request stage built from the previous stage's result.
    fn add_stage_fn<F>(self, factory: F) -> Self
    where
        F: Fn(Option<&Output>) -> Result<RequestConfig> + Send + Sync + 'static,
    {
        self.add_stage(RequestStage::from_fn(factory))
    }

    fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.base_mut().adapter = Some(adapter);
        self
    }

    fn on_result<F>(mut self, f: F) -> Self
    where
        F: Fn(&Output) + Send + Sync + 'static,
    {
        self.base_mut().handlers.on_result = Some(Arc::new(f));
        self
    }

    fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&RelayError) + Send + Sync + 'static,
    {
        self.base_mut().handlers.on_error = Some(Arc::new(f));
        self
    }

    fn on_finish<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.base_mut().handlers.on_finish = Some(Arc::new(f));
        self
    }

    /// Limit how deeply flows may nest below this one when it runs as the
    /// outermost flow.
    fn with_max_depth(mut self, depth: usize) -> Self {
        self.base_mut().max_depth = depth;
        self
    }

    /// Apply the `[engine]` config section.
    fn with_engine_config(mut self, config: &EngineConfig) -> Self {
        self.base_mut().max_depth = config.max_nesting_depth;
        self
    }

    fn stages(&self) -> &[Stage] {
        &self.base().stages
    }

    fn len(&self) -> usize {
        self.base().stages.len()
    }

    fn is_empty(&self) -> bool {
        self.base().stages.is_empty()
    }

    /// Per-stage results of the most recent execution, by declaration
    /// index. A skipped chain stage carries its predecessor's result.
    fn stage_results(&self) -> Vec<Option<Output>> {
        self.base().snapshot()
    }
}

/// Per-execution state threaded through nested flows.
#[derive(Clone)]
pub(crate) struct ExecCtx {
    pub adapter: Option<Arc<dyn Adapter>>,
    pub depth: usize,
    pub max_depth: usize,
    pub execution_id: Uuid,
}

impl ExecCtx {
    pub fn root(base: &FlowBase) -> Self {
        Self {
            adapter: base.adapter.clone(),
            depth: 0,
            max_depth: base.max_depth,
            execution_id: Uuid::new_v4(),
        }
    }

    /// Context for a flow nested one level below this one. The nested
    /// flow's own adapter wins over the inherited one.
    fn enter(&self, base: &FlowBase) -> Result<Self> {
        let depth = self.depth + 1;
        if depth > self.max_depth {
            return Err(RelayError::NestingTooDeep {
                depth,
                limit: self.max_depth,
            });
        }
        Ok(Self {
            adapter: base.adapter.clone().or_else(|| self.adapter.clone()),
            depth,
            max_depth: self.max_depth,
            execution_id: self.execution_id,
        })
    }
}

/// A flow embedded in another flow's stage list.
///
/// Nested flows are frozen behind `Arc`, so a flow can never contain
/// itself. The same flow may still appear under several parents.
#[derive(Clone)]
pub enum NestedFlow {
    Chain(Arc<Chain>),
    Batch(Arc<Batch>),
}

impl NestedFlow {
    /// Run the nested flow to completion. A chain yields its last result
    /// (null when every stage was skipped), a batch yields the ordered list.
    pub(crate) fn run<'a>(&'a self, parent: &'a ExecCtx) -> BoxFuture<'a, Result<Output>> {
        Box::pin(async move {
            match self {
                Self::Chain(chain) => {
                    let ctx = parent.enter(chain.base())?;
                    let last = chain.run_last(&ctx).await?;
                    Ok(last.unwrap_or_else(Output::null))
                }
                Self::Batch(batch) => {
                    let ctx = parent.enter(batch.base())?;
                    let results = batch.run_all(&ctx).await?;
                    Ok(Output::List(results))
                }
            }
        })
    }
}

impl From<Chain> for NestedFlow {
    fn from(chain: Chain) -> Self {
        Self::Chain(Arc::new(chain))
    }
}

impl From<Arc<Chain>> for NestedFlow {
    fn from(chain: Arc<Chain>) -> Self {
        Self::Chain(chain)
    }
}

impl From<Batch> for NestedFlow {
    fn from(batch: Batch) -> Self {
        Self::Batch(Arc::new(batch))
    }
}

impl From<Arc<Batch>> for NestedFlow {
    fn from(batch: Arc<Batch>) -> Self {
        Self::Batch(batch)
    }
}

/// Resolve, transform and intercept one stage.
///
/// `previous` is the previous stage's recorded result in a chain and
/// always `None` in a batch. Failures come back wrapped with the stage
/// index and resolved config, after the stage's own error hook has run.
pub(crate) async fn run_stage(
    stage: &Stage,
    index: usize,
    previous: Option<Output>,
    ctx: &ExecCtx,
) -> Result<Output> {
    let hooks = stage.hooks();
    debug!(stage = index, kind = stage.kind(), depth = ctx.depth, "Running stage");

    let (config, raw) = match stage {
        Stage::Request(request) => {
            let config = match request.config.resolve(previous.as_ref()) {
                Ok(config) if request.wants_stream() => config.streamed(),
                Ok(config) => config,
                Err(e) => return Err(fail(hooks, index, None, e).await),
            };
            let raw = call(request, &config, ctx).await;
            (Some(config), raw)
        }
        Stage::Flow(nested) => (None, nested.flow.run(ctx).await),
    };

    let outcome = match raw {
        Ok(raw) => transform(hooks, raw, previous).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(output) => Ok(output),
        Err(e) => Err(fail(hooks, index, config, e).await),
    }
}

async fn call(stage: &RequestStage, config: &RequestConfig, ctx: &ExecCtx) -> Result<Output> {
    let adapter = ctx.adapter.as_deref().ok_or(RelayError::MissingAdapter)?;
    match &stage.retry {
        Some(policy) => retry::execute(adapter, config, policy, stage.stream.as_ref()).await,
        None => retry::fetch_once(adapter, config, stage.stream.as_ref()).await,
    }
}

async fn transform(hooks: &StageHooks, raw: Output, previous: Option<Output>) -> Result<Output> {
    let output = match &hooks.mapper {
        Some(mapper) => mapper(raw, previous).await?,
        None => raw,
    };
    if let Some(interceptor) = &hooks.interceptor {
        interceptor(output.clone()).await?;
    }
    Ok(output)
}

async fn fail(
    hooks: &StageHooks,
    index: usize,
    config: Option<RequestConfig>,
    err: RelayError,
) -> RelayError {
    let err = err.in_stage(index, config);
    if let Some(handler) = &hooks.on_error {
        handler(err.clone()).await;
    }
    error!(stage = index, error = %err, "Stage failed");
    err
}

/// Log a stage skipped by its precondition.
pub(crate) fn log_skip(index: usize, stage: &Stage) {
    debug!(stage = index, kind = stage.kind(), "Precondition false, skipping stage");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use relay_core::types::RequestConfig;

    #[test]
    fn settle_skips_result_handler_without_output() {
        let results = Arc::new(AtomicUsize::new(0));
        let finishes = Arc::new(AtomicUsize::new(0));
        let (r, f) = (results.clone(), finishes.clone());
        let handlers = FlowHandlers {
            on_result: Some(Arc::new(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            })),
            on_error: None,
            on_finish: Some(Arc::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        };

        handlers.settle(Ok(None));
        handlers.settle(Ok(Some(&Output::Text("x".into()))));
        handlers.settle(Err(&RelayError::MissingAdapter));

        assert_eq!(results.load(Ordering::SeqCst), 1);
        assert_eq!(finishes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn record_pads_unrun_stages() {
        let chain = Chain::new()
            .add_stage(RequestConfig::get("https://a.test"))
            .add_stage(RequestConfig::get("https://b.test"));
        chain.base().record(vec![Some(Output::Text("a".into()))]);
        assert_eq!(
            chain.stage_results(),
            vec![Some(Output::Text("a".into())), None]
        );
    }

    #[test]
    fn nesting_beyond_limit_is_rejected() {
        let base = FlowBase {
            max_depth: 1,
            ..FlowBase::default()
        };
        let root = ExecCtx::root(&base);
        let child = root.enter(&FlowBase::default()).unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.execution_id, root.execution_id);

        match child.enter(&FlowBase::default()) {
            Err(RelayError::NestingTooDeep { depth, limit }) => {
                assert_eq!(depth, 2);
                assert_eq!(limit, 1);
            }
            _ => panic!("expected NestingTooDeep"),
        }
    }
}
