//! 并行组合器
//!
//! 每个子单元在独立的 tokio 任务中运行：拿到同一份汇合前的状态快照，事件与增量写入私有缓冲。
//! 全部结束后按声明顺序把缓冲追加到父级（同名 key 后声明者胜出）。
//! 失败分支只追加事件、不合并增量；组合器随后追加汇总错误，列出失败的子单元。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::agent::{InvocationContext, ResumeTarget, TurnUnit, Unit, UnitFailure, UnitOutcome};
use crate::confirmation::unresolved_requests;
use crate::core::AgentError;
use crate::session::{is_under, Event, StateDelta};

pub struct ParallelUnit {
    name: String,
    sub_units: Vec<Arc<Unit>>,
}

/// 每个子单元在本次运行中的处理方式
enum Plan {
    Run(Option<ResumeTarget>),
    /// 上次运行已完成
    Skip,
    /// 上次运行已失败（recoverable 标记）
    Failed(bool),
}

enum Joined {
    Ran(Vec<Event>, Result<UnitOutcome, UnitFailure>),
    Skipped,
    FailedBefore(bool),
}

impl ParallelUnit {
    pub fn new(name: impl Into<String>, sub_units: Vec<Unit>) -> Self {
        Self {
            name: name.into(),
            sub_units: sub_units.into_iter().map(Arc::new).collect(),
        }
    }

    /// 恢复时：目标分支带决定重跑；仍有未决请求的分支重新发出请求；其余分支沿用上次结果
    fn plan(&self, ctx: &InvocationContext, history: &[Event]) -> Vec<Plan> {
        let target = ctx
            .resume_target()
            .filter(|t| is_under(&t.branch, &ctx.branch))
            .cloned();
        let Some(target) = target else {
            return self.sub_units.iter().map(|_| Plan::Run(None)).collect();
        };

        let invocation: Vec<&Event> = history
            .iter()
            .filter(|e| e.invocation_id == ctx.invocation_id)
            .collect();
        let pending = unresolved_requests(invocation.iter().copied());

        self.sub_units
            .iter()
            .map(|unit| {
                let branch = ctx.child_branch(unit.name());
                if is_under(&target.branch, &branch) {
                    return Plan::Run(Some(target.clone()));
                }
                if let Some(request) = pending.iter().rev().find(|r| is_under(&r.branch, &branch)) {
                    return Plan::Run(Some(ResumeTarget {
                        branch: request.branch.clone(),
                        request: request.clone(),
                        decision: None,
                    }));
                }
                // 子单元自身的失败，或其下任何致命失败
                let failure = invocation.iter().find(|e| {
                    e.error.as_ref().map_or(false, |err| {
                        err.unit_failed
                            && (e.branch == branch || (!err.recoverable && is_under(&e.branch, &branch)))
                    })
                });
                match failure.and_then(|e| e.error.as_ref()) {
                    Some(err) => Plan::Failed(err.recoverable),
                    None => Plan::Skip,
                }
            })
            .collect()
    }
}

#[async_trait]
impl TurnUnit for ParallelUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut InvocationContext) -> Result<UnitOutcome, UnitFailure> {
        ctx.check_cancelled(&self.name).await?;
        let history = Arc::new(
            ctx.history()
                .await
                .map_err(|e| UnitFailure::new(&self.name, e, false))?,
        );
        let plans = self.plan(ctx, &history);
        ctx.clear_resume();

        let mut slots = Vec::with_capacity(self.sub_units.len());
        let mut handles = Vec::new();
        for (unit, plan) in self.sub_units.iter().zip(plans) {
            match plan {
                Plan::Run(resume) => {
                    let mut child = ctx.fork(history.clone(), ctx.child_branch(unit.name()), resume);
                    let unit = unit.clone();
                    handles.push(tokio::spawn(async move {
                        let result = unit.run(&mut child).await;
                        (child.into_buffer(), result)
                    }));
                    slots.push(None);
                }
                Plan::Skip => slots.push(Some(Joined::Skipped)),
                Plan::Failed(recoverable) => slots.push(Some(Joined::FailedBefore(recoverable))),
            }
        }

        let mut finished = join_all(handles).await.into_iter();
        let mut suspended = false;
        let mut failed = Vec::new();
        let mut all_recoverable = true;

        for (unit, slot) in self.sub_units.iter().zip(slots) {
            let joined = match slot {
                Some(joined) => joined,
                None => match finished.next() {
                    Some(Ok((events, result))) => Joined::Ran(events, result),
                    Some(Err(join_err)) => Joined::Ran(
                        Vec::new(),
                        Err(UnitFailure::new(
                            unit.name(),
                            AgentError::TaskAborted(join_err.to_string()),
                            false,
                        )),
                    ),
                    None => Joined::Skipped,
                },
            };

            match joined {
                Joined::Ran(events, Ok(outcome)) => {
                    suspended |= outcome == UnitOutcome::Suspended;
                    for event in events {
                        ctx.emit_for(&self.name, event).await?;
                    }
                }
                Joined::Ran(events, Err(failure)) => {
                    all_recoverable &= failure.recoverable;
                    failed.push(unit.name().to_string());
                    for mut event in events {
                        event.actions.state_delta = StateDelta::new();
                        ctx.emit_for(&self.name, event).await?;
                    }
                }
                Joined::FailedBefore(recoverable) => {
                    all_recoverable &= recoverable;
                    failed.push(unit.name().to_string());
                }
                Joined::Skipped => {}
            }
        }

        if suspended {
            return Ok(UnitOutcome::Suspended);
        }
        if !failed.is_empty() {
            return Err(ctx
                .fail(&self.name, AgentError::ParallelFailed { failed }, all_recoverable)
                .await);
        }
        Ok(UnitOutcome::Completed)
    }
}
