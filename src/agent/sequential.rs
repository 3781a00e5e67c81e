//! 顺序组合器
//!
//! 依次运行子单元；每个子单元运行前重新读取状态，因此总能看到前序单元的 output_key 写入。
//! 致命失败中止剩余子单元并向上传播；可恢复失败已记录为 Error 事件，继续执行下一个。

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::{InvocationContext, TurnUnit, Unit, UnitFailure, UnitOutcome};

pub struct SequentialUnit {
    name: String,
    sub_units: Vec<Arc<Unit>>,
}

impl SequentialUnit {
    pub fn new(name: impl Into<String>, sub_units: Vec<Unit>) -> Self {
        Self {
            name: name.into(),
            sub_units: sub_units.into_iter().map(Arc::new).collect(),
        }
    }
}

#[async_trait]
impl TurnUnit for SequentialUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut InvocationContext) -> Result<UnitOutcome, UnitFailure> {
        run_in_order(&self.name, &self.sub_units, ctx).await
    }
}

/// 顺序执行（Loop 的每一轮也复用）；恢复时跳过恢复目标之前已完成的子单元
pub(crate) async fn run_in_order(
    owner: &str,
    units: &[Arc<Unit>],
    ctx: &mut InvocationContext,
) -> Result<UnitOutcome, UnitFailure> {
    let start = ctx.resume_index(units).unwrap_or(0);
    for (i, unit) in units.iter().enumerate().skip(start) {
        ctx.check_cancelled(owner).await?;
        ctx.refresh_state()
            .await
            .map_err(|e| UnitFailure::new(owner, e, false))?;

        let parent = ctx.enter(unit.name());
        let result = unit.run(ctx).await;
        ctx.set_branch(parent);
        if i == start {
            ctx.clear_resume();
        }

        match result {
            Ok(UnitOutcome::Suspended) => return Ok(UnitOutcome::Suspended),
            Ok(_) => {}
            Err(failure) if failure.recoverable => {
                tracing::warn!(
                    invocation_id = %ctx.invocation_id,
                    unit = %failure.unit,
                    error = %failure.error,
                    "recoverable failure, continuing with next unit"
                );
            }
            Err(failure) => return Err(failure),
        }
    }
    Ok(UnitOutcome::Completed)
}
