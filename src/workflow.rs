//! Declarative workflow files.
//!
//! A workflow is a TOML document describing one chain or batch:
//!
//! ```toml
//! mode = "chain"
//!
//! [[stages]]
//! target = "https://api.example.com/users/1"
//!
//! [[stages]]
//! target = "https://api.example.com/posts?user={{/id}}"
//! select = "/0"
//! retry = true
//! ```
//!
//! `{{/pointer}}` placeholders in a target are filled from the previous
//! stage's result. A stage holds either a `target` or a nested `flow`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use relay_core::config::{AppConfig, RetryConfig, StreamConfig};
use relay_core::error::{RelayError, Result};
use relay_core::traits::Adapter;
use relay_core::types::{Method, Output, RequestConfig};
use relay_engine::{
    Batch, Chain, Flow, FlowStage, RequestStage, RetryPolicy, Stage, StageExt, StreamPolicy,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Chain,
    Batch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub mode: Mode,
    /// Batch concurrency ceiling. Falls back to `engine.default_concurrency`.
    #[serde(default)]
    pub concurrency: Option<i64>,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

/// `true` picks up the matching config section; a table overrides it.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Toggle<T> {
    Enabled(bool),
    Custom(T),
}

impl<T: Clone> Toggle<T> {
    fn resolve(&self, defaults: &T) -> Option<T> {
        match self {
            Self::Enabled(true) => Some(defaults.clone()),
            Self::Enabled(false) => None,
            Self::Custom(custom) => Some(custom.clone()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageSpec {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default, alias = "method")]
    pub verb: Method,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: Option<serde_json::Value>,
    /// Skip this stage without calling the transport.
    #[serde(default)]
    pub skip: bool,
    /// JSON pointer applied to the stage's result.
    #[serde(default)]
    pub select: Option<String>,
    #[serde(default)]
    pub retry: Option<Toggle<RetryConfig>>,
    #[serde(default)]
    pub stream: Option<Toggle<StreamConfig>>,
    #[serde(default)]
    pub flow: Option<Box<Workflow>>,
}

/// A workflow turned into an executable flow.
pub enum Runnable {
    Chain(Chain),
    Batch(Batch),
}

impl Runnable {
    /// Run the flow. A chain yields its last result unless `all` is set; a
    /// batch always yields every result.
    pub async fn run(&self, all: bool) -> Result<serde_json::Value> {
        match self {
            Self::Chain(chain) if all => Ok(Output::List(chain.execute_all().await?).to_json()),
            Self::Chain(chain) => Ok(chain
                .execute()
                .await?
                .map(|o| o.to_json())
                .unwrap_or(serde_json::Value::Null)),
            Self::Batch(batch) => Ok(Output::List(batch.execute().await?).to_json()),
        }
    }
}

impl Workflow {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = relay_core::config::expand_env_vars(&content);
        toml::from_str(&expanded).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Build the outermost flow, bound to `adapter`.
    pub fn build(&self, config: &AppConfig, adapter: Arc<dyn Adapter>) -> Result<Runnable> {
        Ok(match self.build_flow(config)? {
            Runnable::Chain(chain) => Runnable::Chain(chain.with_adapter(adapter)),
            Runnable::Batch(batch) => Runnable::Batch(batch.with_adapter(adapter)),
        })
    }

    fn build_flow(&self, config: &AppConfig) -> Result<Runnable> {
        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                spec.build(config)
                    .map_err(|e| RelayError::Config(format!("stage {}: {}", index, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        match self.mode {
            Mode::Chain => {
                let chain = Chain::new().with_engine_config(&config.engine);
                Ok(Runnable::Chain(
                    stages.into_iter().fold(chain, |c, s| c.add_stage(s)),
                ))
            }
            Mode::Batch => {
                let batch = match self.concurrency {
                    Some(limit) => Batch::new()
                        .with_engine_config(&config.engine)
                        .with_concurrency(limit)?,
                    None => Batch::from_engine_config(&config.engine)?,
                };
                Ok(Runnable::Batch(
                    stages.into_iter().fold(batch, |b, s| b.add_stage(s)),
                ))
            }
        }
    }
}

impl StageSpec {
    fn build(&self, config: &AppConfig) -> Result<Stage> {
        let mut stage: Stage = match (&self.target, &self.flow) {
            (Some(_), Some(_)) => {
                return Err(RelayError::Config(
                    "a stage takes either `target` or `flow`, not both".into(),
                ))
            }
            (None, None) => {
                return Err(RelayError::Config("a stage needs `target` or `flow`".into()))
            }
            (None, Some(flow)) => match flow.build_flow(config)? {
                Runnable::Chain(chain) => FlowStage::new(chain).into(),
                Runnable::Batch(batch) => FlowStage::new(batch).into(),
            },
            (Some(target), None) => self.request_stage(target, config)?.into(),
        };

        if self.skip {
            stage = stage.when(|| false);
        }
        if let Some(pointer) = &self.select {
            let pointer = pointer.clone();
            stage = stage.map(move |out, _| select(&out, &pointer));
        }
        Ok(stage)
    }

    fn request_stage(&self, target: &str, config: &AppConfig) -> Result<RequestStage> {
        let mut template = RequestConfig::new(self.verb, target);
        template.headers = self.headers.clone();
        template.payload = self.payload.clone();
        if let Some(query) = &self.query {
            template = template.with_extra("query", query.clone());
        }

        let stream = self
            .stream
            .as_ref()
            .and_then(|s| s.resolve(&config.stream))
            .map(|s| StreamPolicy::from_config(&s))
            .transpose()?;

        let mut stage = if target.contains("{{") {
            RequestStage::from_fn(move |previous| {
                let mut config = template.clone();
                config.target = render_target(&template.target, previous)?;
                Ok(config)
            })
        } else {
            RequestStage::new(template)
        };

        if let Some(retry) = self.retry.as_ref().and_then(|r| r.resolve(&config.retry)) {
            stage = stage.retry(RetryPolicy::from_config(&retry));
        }
        if let Some(policy) = stream {
            stage = stage.stream(policy.on_chunk(|chunk, meta| {
                debug!(
                    index = meta.index,
                    bytes = chunk.len(),
                    cumulative = meta.cumulative_bytes,
                    last = meta.is_last,
                    "Stream chunk"
                );
            }));
        }
        Ok(stage)
    }
}

/// Fill `{{/pointer}}` placeholders from the previous result.
fn render_target(template: &str, previous: Option<&Output>) -> Result<String> {
    let previous = previous.map(Output::to_json).unwrap_or(serde_json::Value::Null);
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| RelayError::Pipeline(format!("unclosed placeholder in {}", template)))?;
        let pointer = after[..end].trim();
        let value = previous.pointer(pointer).ok_or_else(|| {
            RelayError::Pipeline(format!("previous result has no value at {}", pointer))
        })?;
        match value {
            serde_json::Value::String(s) => rendered.push_str(s),
            other => rendered.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

fn select(output: &Output, pointer: &str) -> Result<Output> {
    output
        .to_json()
        .pointer(pointer)
        .cloned()
        .map(Output::Json)
        .ok_or_else(|| RelayError::Pipeline(format!("result has no value at {}", pointer)))
}
