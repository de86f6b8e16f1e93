use tracing::info;

use relay_core::error::Result;
use relay_core::types::Output;

use crate::flow::{self, ExecCtx, Flow, FlowBase};

/// Sequential executor. Stage `i + 1` starts only after stage `i` has been
/// resolved, mapped, intercepted and recorded.
///
/// Each stage sees the previous stage's recorded result. A stage skipped
/// by its precondition records its predecessor's result unchanged and
/// produces nothing.
#[derive(Default)]
pub struct Chain {
    base: FlowBase,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every stage and return the last produced result, or `None` when
    /// every stage was skipped.
    pub async fn execute(&self) -> Result<Option<Output>> {
        let ctx = ExecCtx::root(&self.base);
        self.run_last(&ctx).await
    }

    /// Run every stage and return all produced results in order. Skipped
    /// stages are absent.
    pub async fn execute_all(&self) -> Result<Vec<Output>> {
        let ctx = ExecCtx::root(&self.base);
        let outcome = self.drive(&ctx).await;
        match &outcome {
            Ok(produced) if !produced.is_empty() => {
                let aggregate = Output::List(produced.clone());
                self.base.handlers.settle(Ok(Some(&aggregate)));
            }
            Ok(_) => self.base.handlers.settle(Ok(None)),
            Err(e) => self.base.handlers.settle(Err(e)),
        }
        outcome
    }

    pub(crate) async fn run_last(&self, ctx: &ExecCtx) -> Result<Option<Output>> {
        let outcome = self.drive(ctx).await.map(|mut produced| produced.pop());
        match &outcome {
            Ok(last) => self.base.handlers.settle(Ok(last.as_ref())),
            Err(e) => self.base.handlers.settle(Err(e)),
        }
        outcome
    }

    async fn drive(&self, ctx: &ExecCtx) -> Result<Vec<Output>> {
        let stages = &self.base.stages;
        info!(
            execution_id = %ctx.execution_id,
            depth = ctx.depth,
            stages = stages.len(),
            "Executing chain"
        );

        let mut slots: Vec<Option<Output>> = Vec::with_capacity(stages.len());
        let mut produced = Vec::with_capacity(stages.len());

        for (index, stage) in stages.iter().enumerate() {
            let previous = slots.last().cloned().flatten();

            if !stage.hooks().should_run() {
                flow::log_skip(index, stage);
                slots.push(previous);
                continue;
            }

            match flow::run_stage(stage, index, previous, ctx).await {
                Ok(output) => {
                    slots.push(Some(output.clone()));
                    produced.push(output);
                }
                Err(e) => {
                    self.base.record(slots);
                    return Err(e);
                }
            }
        }

        self.base.record(slots);
        info!(
            execution_id = %ctx.execution_id,
            produced = produced.len(),
            "Chain complete"
        );
        Ok(produced)
    }
}

impl Flow for Chain {
    fn base(&self) -> &FlowBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut FlowBase {
        &mut self.base
    }
}
