//! 循环组合器
//!
//! 每一轮按顺序规则运行子单元，分支路径为 `<loop>#<n>`。
//! 每轮结束后检查该轮事件中是否有终止信号，有则停止；达到 max_iterations 正常结束，不算错误。

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::sequential::run_in_order;
use crate::agent::{InvocationContext, TurnUnit, Unit, UnitFailure, UnitOutcome};
use crate::session::is_under;

pub struct LoopUnit {
    name: String,
    sub_units: Vec<Arc<Unit>>,
    max_iterations: usize,
}

impl LoopUnit {
    pub fn new(name: impl Into<String>, sub_units: Vec<Unit>, max_iterations: usize) -> Self {
        Self {
            name: name.into(),
            sub_units: sub_units.into_iter().map(Arc::new).collect(),
            max_iterations,
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// 恢复目标位于第几轮（`<loop>#<n>...`）
    fn resume_iteration(&self, ctx: &InvocationContext) -> Option<usize> {
        let target = ctx.resume_target()?;
        if !is_under(&target.branch, &ctx.branch) {
            return None;
        }
        let rest = target.branch.strip_prefix(&ctx.branch)?.strip_prefix('#')?;
        rest.split('.').next()?.parse().ok()
    }

    async fn pass_terminated(
        &self,
        ctx: &InvocationContext,
        pass_branch: &str,
    ) -> Result<bool, UnitFailure> {
        let events = ctx
            .invocation_events()
            .await
            .map_err(|e| UnitFailure::new(&self.name, e, false))?;
        Ok(events
            .iter()
            .any(|e| e.actions.terminate && is_under(&e.branch, pass_branch)))
    }
}

#[async_trait]
impl TurnUnit for LoopUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut InvocationContext) -> Result<UnitOutcome, UnitFailure> {
        let base = ctx.branch.clone();
        let first = match self.resume_iteration(ctx) {
            Some(n) => n,
            None => {
                ctx.clear_resume();
                1
            }
        };

        for n in first..=self.max_iterations {
            let pass_branch = format!("{base}#{n}");
            ctx.set_branch(pass_branch.clone());
            let result = run_in_order(&self.name, &self.sub_units, ctx).await;
            ctx.set_branch(base.clone());

            if result? == UnitOutcome::Suspended {
                return Ok(UnitOutcome::Suspended);
            }
            if self.pass_terminated(ctx, &pass_branch).await? {
                tracing::info!(
                    invocation_id = %ctx.invocation_id,
                    unit = %self.name,
                    iteration = n,
                    "loop terminated by signal"
                );
                return Ok(UnitOutcome::Completed);
            }
            tracing::debug!(unit = %self.name, iteration = n, "loop pass finished");
        }
        tracing::info!(
            invocation_id = %ctx.invocation_id,
            unit = %self.name,
            max_iterations = self.max_iterations,
            "loop reached max iterations"
        );
        Ok(UnitOutcome::Completed)
    }
}
