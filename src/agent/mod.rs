//! Turn Unit：最小可组合执行单元
//!
//! Unit 是带标签的联合体 {Leaf, Sequential, Parallel, Loop, Remote}，组合器可递归嵌套。
//! 单元的结果只有三种：完成、挂起（等待外部确认）、或以 UnitFailure 报错；是否中止整个 Invocation 由外层组合器决定。

pub mod context;
pub mod leaf;
pub mod loop_;
pub mod parallel;
pub mod remote;
pub mod sequential;

use async_trait::async_trait;

use crate::core::AgentError;

pub use context::{InvocationContext, ResumeTarget, Services, Sink};
pub use leaf::{render_instruction, LeafUnit};
pub use loop_::LoopUnit;
pub use parallel::ParallelUnit;
pub use remote::{
    AgentCard, HttpRemoteClient, RemoteAgentClient, RemoteRequest, RemoteResponse, RemoteStatus,
    RemoteUnit, WELL_KNOWN_AGENT_CARD_PATH,
};
pub use sequential::SequentialUnit;

/// 单元运行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Completed,
    /// 等待外部确认；已产生的事件全部保留
    Suspended,
    /// 工具发出了终止信号，叶子单元提前结束本回合
    Terminated,
}

/// 单元失败；recoverable 为 true 时外层 Sequential / Loop 继续执行后续单元
#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub unit: String,
    pub error: AgentError,
    pub recoverable: bool,
}

impl UnitFailure {
    pub fn new(unit: impl Into<String>, error: AgentError, recoverable: bool) -> Self {
        Self {
            unit: unit.into(),
            error,
            recoverable,
        }
    }
}

impl std::fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.unit, self.error)
    }
}

#[async_trait]
pub trait TurnUnit: Send + Sync {
    fn name(&self) -> &str;

    /// 在 ctx.branch 指向本单元路径时运行
    async fn run(&self, ctx: &mut InvocationContext) -> Result<UnitOutcome, UnitFailure>;
}

/// 单元联合体
pub enum Unit {
    Leaf(LeafUnit),
    Sequential(SequentialUnit),
    Parallel(ParallelUnit),
    Loop(LoopUnit),
    Remote(RemoteUnit),
}

#[async_trait]
impl TurnUnit for Unit {
    fn name(&self) -> &str {
        match self {
            Unit::Leaf(u) => u.name(),
            Unit::Sequential(u) => u.name(),
            Unit::Parallel(u) => u.name(),
            Unit::Loop(u) => u.name(),
            Unit::Remote(u) => u.name(),
        }
    }

    async fn run(&self, ctx: &mut InvocationContext) -> Result<UnitOutcome, UnitFailure> {
        if ctx.resume_target().is_none() {
            tracing::debug!(invocation_id = %ctx.invocation_id, branch = %ctx.branch, "unit start");
        }
        match self {
            Unit::Leaf(u) => u.run(ctx).await,
            Unit::Sequential(u) => u.run(ctx).await,
            Unit::Parallel(u) => u.run(ctx).await,
            Unit::Loop(u) => u.run(ctx).await,
            Unit::Remote(u) => u.run(ctx).await,
        }
    }
}

impl From<LeafUnit> for Unit {
    fn from(u: LeafUnit) -> Self {
        Unit::Leaf(u)
    }
}

impl From<SequentialUnit> for Unit {
    fn from(u: SequentialUnit) -> Self {
        Unit::Sequential(u)
    }
}

impl From<ParallelUnit> for Unit {
    fn from(u: ParallelUnit) -> Self {
        Unit::Parallel(u)
    }
}

impl From<LoopUnit> for Unit {
    fn from(u: LoopUnit) -> Self {
        Unit::Loop(u)
    }
}

impl From<RemoteUnit> for Unit {
    fn from(u: RemoteUnit) -> Self {
        Unit::Remote(u)
    }
}
