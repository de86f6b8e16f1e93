use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use relay_core::error::{RelayError, Result};
use relay_core::types::{Output, RequestConfig};

use crate::flow::NestedFlow;
use crate::retry::RetryPolicy;
use crate::stream::StreamPolicy;

/// Gates whether a stage runs at all.
pub type Precondition = Arc<dyn Fn() -> bool + Send + Sync>;

/// Builds a request config from the previous stage's result.
pub type ConfigFactory = Arc<dyn Fn(Option<&Output>) -> Result<RequestConfig> + Send + Sync>;

/// Turns a raw result (and, in chains, the previous result) into the
/// stage's recorded result.
pub type Mapper =
    Arc<dyn Fn(Output, Option<Output>) -> BoxFuture<'static, Result<Output>> + Send + Sync>;

/// Side effect run with a stage's final result.
pub type Interceptor = Arc<dyn Fn(Output) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Stage-local failure hook. Runs before anything else observes the error.
pub type StageErrorHandler = Arc<dyn Fn(RelayError) -> BoxFuture<'static, ()> + Send + Sync>;

/// A request config given up front or computed at resolution time.
#[derive(Clone)]
pub enum ConfigSource {
    Literal(RequestConfig),
    Factory(ConfigFactory),
}

impl ConfigSource {
    pub fn resolve(&self, previous: Option<&Output>) -> Result<RequestConfig> {
        match self {
            Self::Literal(config) => Ok(config.clone()),
            Self::Factory(factory) => factory(previous),
        }
    }
}

impl From<RequestConfig> for ConfigSource {
    fn from(config: RequestConfig) -> Self {
        Self::Literal(config)
    }
}

/// Optional capabilities shared by both stage variants.
#[derive(Clone, Default)]
pub struct StageHooks {
    pub precondition: Option<Precondition>,
    pub mapper: Option<Mapper>,
    pub interceptor: Option<Interceptor>,
    pub on_error: Option<StageErrorHandler>,
}

impl StageHooks {
    /// `true` unless a precondition exists and returns `false`.
    pub fn should_run(&self) -> bool {
        self.precondition.as_ref().map_or(true, |p| p())
    }
}

/// A stage that issues one transport call.
#[derive(Clone)]
pub struct RequestStage {
    pub config: ConfigSource,
    pub retry: Option<RetryPolicy>,
    pub stream: Option<StreamPolicy>,
    pub hooks: StageHooks,
}

impl RequestStage {
    pub fn new(config: RequestConfig) -> Self {
        Self {
            config: ConfigSource::Literal(config),
            retry: None,
            stream: None,
            hooks: StageHooks::default(),
        }
    }

    /// Build the config from the previous stage's result when the stage
    /// runs.
    pub fn from_fn<F>(factory: F) -> Self
    where
        F: Fn(Option<&Output>) -> Result<RequestConfig> + Send + Sync + 'static,
    {
        Self {
            config: ConfigSource::Factory(Arc::new(factory)),
            retry: None,
            stream: None,
            hooks: StageHooks::default(),
        }
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn stream(mut self, policy: StreamPolicy) -> Self {
        self.stream = Some(policy);
        self
    }

    /// Whether the adapter should be asked for a streamed body.
    pub fn wants_stream(&self) -> bool {
        self.stream.as_ref().is_some_and(|policy| policy.enabled)
    }
}

/// A stage that runs a nested flow to completion.
#[derive(Clone)]
pub struct FlowStage {
    pub flow: NestedFlow,
    pub hooks: StageHooks,
}

impl FlowStage {
    pub fn new(flow: impl Into<NestedFlow>) -> Self {
        Self {
            flow: flow.into(),
            hooks: StageHooks::default(),
        }
    }
}

/// One declared unit of work in a flow.
#[derive(Clone)]
pub enum Stage {
    Request(RequestStage),
    Flow(FlowStage),
}

impl Stage {
    pub fn hooks(&self) -> &StageHooks {
        match self {
            Self::Request(s) => &s.hooks,
            Self::Flow(s) => &s.hooks,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Flow(_) => "flow",
        }
    }
}

impl From<RequestStage> for Stage {
    fn from(s: RequestStage) -> Self {
        Self::Request(s)
    }
}

impl From<FlowStage> for Stage {
    fn from(s: FlowStage) -> Self {
        Self::Flow(s)
    }
}

impl From<RequestConfig> for Stage {
    fn from(config: RequestConfig) -> Self {
        Self::Request(RequestStage::new(config))
    }
}

/// Builder methods for the hooks every stage variant carries.
pub trait StageExt: Sized {
    fn hooks_mut(&mut self) -> &mut StageHooks;

    /// Run the stage only when `f` returns `true`.
    fn when<F>(mut self, f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.hooks_mut().precondition = Some(Arc::new(f));
        self
    }

    /// Transform the raw result. The second argument is the previous
    /// stage's result in a chain, always `None` in a batch.
    fn map<F>(self, f: F) -> Self
    where
        F: Fn(Output, Option<Output>) -> Result<Output> + Send + Sync + 'static,
    {
        self.map_async(move |out, prev| {
            let mapped = f(out, prev);
            async move { mapped }
        })
    }

    fn map_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Output, Option<Output>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output>> + Send + 'static,
    {
        self.hooks_mut().mapper = Some(Arc::new(move |out, prev| Box::pin(f(out, prev))));
        self
    }

    /// Observe the final result. The return value is discarded.
    fn intercept<F>(self, f: F) -> Self
    where
        F: Fn(&Output) + Send + Sync + 'static,
    {
        self.intercept_async(move |out| {
            f(&out);
            async { Ok(()) }
        })
    }

    fn intercept_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Output) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks_mut().interceptor = Some(Arc::new(move |out| Box::pin(f(out))));
        self
    }

    /// Observe a failure of this stage before it propagates.
    fn on_error<F>(self, f: F) -> Self
    where
        F: Fn(&RelayError) + Send + Sync + 'static,
    {
        self.on_error_async(move |err| {
            f(&err);
            async {}
        })
    }

    fn on_error_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(RelayError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks_mut().on_error = Some(Arc::new(move |err| Box::pin(f(err))));
        self
    }
}

impl StageExt for RequestStage {
    fn hooks_mut(&mut self) -> &mut StageHooks {
        &mut self.hooks
    }
}

impl StageExt for FlowStage {
    fn hooks_mut(&mut self) -> &mut StageHooks {
        &mut self.hooks
    }
}

impl StageExt for Stage {
    fn hooks_mut(&mut self) -> &mut StageHooks {
        match self {
            Self::Request(s) => &mut s.hooks,
            Self::Flow(s) => &mut s.hooks,
        }
    }
}
