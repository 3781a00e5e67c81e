//! Invocation 上下文：单元运行时可见的一切
//!
//! 包含当前分支路径、可见状态、事件出口（持久日志或并行分支的私有缓冲）、恢复目标与取消令牌。
//! 所有状态变更都通过 emit 挂在事件上。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::{TurnUnit, UnitFailure};
use crate::compaction::context_view;
use crate::confirmation::ConfirmationController;
use crate::core::{AgentError, ErrorInfo};
use crate::memory::MemoryService;
use crate::runner::EventLog;
use crate::session::{
    is_under, ConfirmationRequest, Event, Message, SessionKey, SessionService, State, USER_AUTHOR,
};

/// 单元共享的外部协作者
#[derive(Clone)]
pub struct Services {
    pub session_service: Arc<dyn SessionService>,
    pub memory_service: Option<Arc<dyn MemoryService>>,
    pub controller: Arc<ConfirmationController>,
}

/// 事件出口
pub enum Sink {
    /// 直接追加到会话日志
    Log(Arc<EventLog>),
    /// 并行分支：基于分叉时的历史快照，事件先写入私有缓冲，汇合时按声明顺序追加
    Buffer {
        base: Arc<Vec<Event>>,
        events: Vec<Event>,
    },
}

/// 恢复目标：挂起请求所在的分支以及外部给出的决定
#[derive(Debug, Clone)]
pub struct ResumeTarget {
    pub branch: String,
    pub request: ConfirmationRequest,
    /// None 表示该分支需要重新发出请求（并行分支中被取代的请求）
    pub decision: Option<bool>,
}

pub struct InvocationContext {
    pub invocation_id: String,
    pub session: SessionKey,
    /// 触发本次 Invocation 的入站消息
    pub user_content: Option<Message>,
    /// 当前单元路径，如 `pipeline.story_loop#2.refiner`
    pub branch: String,
    /// 当前可见状态
    pub state: State,
    sink: Sink,
    resume: Option<ResumeTarget>,
    cancel: CancellationToken,
    services: Services,
}

impl InvocationContext {
    pub fn new(
        invocation_id: impl Into<String>,
        session: SessionKey,
        user_content: Option<Message>,
        state: State,
        log: Arc<EventLog>,
        cancel: CancellationToken,
        services: Services,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            session,
            user_content,
            branch: String::new(),
            state,
            sink: Sink::Log(log),
            resume: None,
            cancel,
            services,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn controller(&self) -> Arc<ConfirmationController> {
        self.services.controller.clone()
    }

    pub fn memory(&self) -> Option<Arc<dyn MemoryService>> {
        self.services.memory_service.clone()
    }

    /// 追加事件：补全 invocation id 与分支，增量同时合并进可见状态
    pub async fn emit(&mut self, mut event: Event) -> Result<Event, AgentError> {
        event.invocation_id = self.invocation_id.clone();
        if event.branch.is_empty() {
            event.branch = self.branch.clone();
        }
        match &mut self.sink {
            Sink::Log(log) => {
                let stored = log.append(event).await?;
                self.state.apply(&stored.actions.state_delta);
                Ok(stored)
            }
            Sink::Buffer { events, .. } => {
                self.state.apply(&event.actions.state_delta);
                events.push(event.clone());
                Ok(event)
            }
        }
    }

    /// emit 失败（存储错误）时转为致命的 UnitFailure
    pub async fn emit_for(&mut self, unit: &str, event: Event) -> Result<Event, UnitFailure> {
        self.emit(event)
            .await
            .map_err(|e| UnitFailure::new(unit, e, false))
    }

    /// 从会话重新读取状态；并行分支保留自己的视图
    pub async fn refresh_state(&mut self) -> Result<(), AgentError> {
        if let Sink::Log(log) = &self.sink {
            self.state = log.state().await?;
        }
        Ok(())
    }

    /// 完整原始历史（审计视图）
    pub async fn history(&self) -> Result<Vec<Event>, AgentError> {
        match &self.sink {
            Sink::Log(log) => log.history().await,
            Sink::Buffer { base, events } => Ok(base.iter().chain(events.iter()).cloned().collect()),
        }
    }

    /// 压缩视图：生成回合上下文时使用
    pub async fn context_events(&self) -> Result<Vec<Event>, AgentError> {
        context_view(&self.history().await?)
    }

    /// 本 Invocation 的事件
    pub async fn invocation_events(&self) -> Result<Vec<Event>, AgentError> {
        Ok(self
            .history()
            .await?
            .into_iter()
            .filter(|e| e.invocation_id == self.invocation_id)
            .collect())
    }

    /// 为并行分支分叉：同一份状态快照、私有事件缓冲、子取消令牌
    pub fn fork(&self, base: Arc<Vec<Event>>, branch: String, resume: Option<ResumeTarget>) -> Self {
        Self {
            invocation_id: self.invocation_id.clone(),
            session: self.session.clone(),
            user_content: self.user_content.clone(),
            branch,
            state: self.state.clone(),
            sink: Sink::Buffer {
                base,
                events: Vec::new(),
            },
            resume,
            cancel: self.cancel.child_token(),
            services: self.services.clone(),
        }
    }

    /// 独立上下文：历史只有一条用户请求，事件写入私有缓冲（工具内运行子单元时使用）
    pub fn detached(
        invocation_id: impl Into<String>,
        session: SessionKey,
        request: Message,
        state: State,
        cancel: CancellationToken,
        services: Services,
    ) -> Self {
        let invocation_id = invocation_id.into();
        let user_event = Event::new(USER_AUTHOR)
            .with_invocation(invocation_id.clone())
            .with_content(request.clone());
        Self {
            invocation_id,
            session,
            user_content: Some(request),
            branch: String::new(),
            state,
            sink: Sink::Buffer {
                base: Arc::new(vec![user_event]),
                events: Vec::new(),
            },
            resume: None,
            cancel,
            services,
        }
    }

    /// 取出并行分支缓冲的事件
    pub fn into_buffer(self) -> Vec<Event> {
        match self.sink {
            Sink::Buffer { events, .. } => events,
            Sink::Log(_) => Vec::new(),
        }
    }

    pub fn child_branch(&self, name: &str) -> String {
        if self.branch.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.branch, name)
        }
    }

    /// 进入子单元路径，返回原路径供 set_branch 恢复
    pub fn enter(&mut self, name: &str) -> String {
        let child = self.child_branch(name);
        std::mem::replace(&mut self.branch, child)
    }

    pub fn set_branch(&mut self, branch: String) {
        self.branch = branch;
    }

    pub fn resume_target(&self) -> Option<&ResumeTarget> {
        self.resume.as_ref()
    }

    pub fn set_resume(&mut self, resume: Option<ResumeTarget>) {
        self.resume = resume;
    }

    pub fn clear_resume(&mut self) {
        self.resume = None;
    }

    /// 恢复目标恰好是当前分支时取走
    pub fn take_resume_for_self(&mut self) -> Option<ResumeTarget> {
        if self.resume.as_ref().map(|t| t.branch == self.branch).unwrap_or(false) {
            self.resume.take()
        } else {
            None
        }
    }

    /// 恢复目标所在的子单元下标
    pub fn resume_index<U: TurnUnit + ?Sized>(&self, units: &[Arc<U>]) -> Option<usize> {
        let target = self.resume.as_ref()?;
        if !is_under(&target.branch, &self.branch) {
            return None;
        }
        units
            .iter()
            .position(|u| is_under(&target.branch, &self.child_branch(u.name())))
    }

    /// 子令牌：随本 Invocation 一起取消
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn check_cancelled(&mut self, unit: &str) -> Result<(), UnitFailure> {
        if self.cancel.is_cancelled() {
            return Err(self.fail(unit, AgentError::Cancelled, false).await);
        }
        Ok(())
    }

    /// 记录单元失败：追加带 ErrorInfo 的事件，返回 UnitFailure 交给外层组合器决定
    pub async fn fail(&mut self, unit: &str, error: AgentError, recoverable: bool) -> UnitFailure {
        if recoverable {
            tracing::warn!(invocation_id = %self.invocation_id, unit, error = %error, "unit failed (recoverable)");
        } else {
            tracing::error!(invocation_id = %self.invocation_id, unit, error = %error, "unit failed");
        }
        let event = Event::new(unit).with_error(ErrorInfo::unit_failure(&error, recoverable));
        if let Err(e) = self.emit(event).await {
            tracing::error!(unit, error = %e, "failed to append error event");
        }
        UnitFailure::new(unit, error, recoverable)
    }
}
