//! 事件日志：Invocation 范围内唯一的追加入口
//!
//! append：写入 SessionService → 控制器登记审批请求 → 推送到事件流 → 依次执行追加后钩子；
//! 钩子产生的派生事件按同样流程追加。

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::confirmation::ConfirmationController;
use crate::core::AgentError;
use crate::runner::{HookContext, RunnerHook};
use crate::session::{Event, Session, SessionKey, SessionService, State};

pub struct EventLog {
    hook_ctx: HookContext,
    controller: Arc<ConfirmationController>,
    hooks: Vec<Arc<dyn RunnerHook>>,
    stream: Option<mpsc::UnboundedSender<Event>>,
    appended: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new(
        session_service: Arc<dyn SessionService>,
        session: SessionKey,
        invocation_id: impl Into<String>,
        controller: Arc<ConfirmationController>,
        hooks: Vec<Arc<dyn RunnerHook>>,
        stream: Option<mpsc::UnboundedSender<Event>>,
    ) -> Self {
        Self {
            hook_ctx: HookContext {
                session_service,
                session,
                invocation_id: invocation_id.into(),
            },
            controller,
            hooks,
            stream,
            appended: Mutex::new(Vec::new()),
        }
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.hook_ctx.session
    }

    pub fn hook_context(&self) -> &HookContext {
        &self.hook_ctx
    }

    /// 追加事件并运行钩子，返回实际存储的事件
    pub async fn append(&self, event: Event) -> Result<Event, AgentError> {
        let mut queue = VecDeque::from([event]);
        let mut first: Option<Event> = None;
        while let Some(next) = queue.pop_front() {
            let stored = self.append_one(next).await?;
            for hook in &self.hooks {
                let derived = hook.after_event(&self.hook_ctx, &stored).await?;
                queue.extend(derived);
            }
            if first.is_none() {
                first = Some(stored);
            }
        }
        first.ok_or_else(|| AgentError::Session("nothing appended".to_string()))
    }

    async fn append_one(&self, event: Event) -> Result<Event, AgentError> {
        let stored = self
            .hook_ctx
            .session_service
            .append_event(&self.hook_ctx.session, event)
            .await?;
        self.controller.observe(&stored).await;
        if let Some(tx) = &self.stream {
            // 接收端关闭只影响流式观察，不影响日志
            let _ = tx.send(stored.clone());
        }
        self.appended.lock().await.push(stored.clone());
        Ok(stored)
    }

    /// 本 Invocation（本次运行）追加的全部事件
    pub async fn appended(&self) -> Vec<Event> {
        self.appended.lock().await.clone()
    }

    pub async fn session(&self) -> Result<Session, AgentError> {
        self.hook_ctx
            .session_service
            .get_session(&self.hook_ctx.session)
            .await?
            .ok_or_else(|| AgentError::Session(format!("session not found: {}", self.hook_ctx.session)))
    }

    pub async fn history(&self) -> Result<Vec<Event>, AgentError> {
        Ok(self.session().await?.events)
    }

    pub async fn state(&self) -> Result<State, AgentError> {
        self.hook_ctx
            .session_service
            .read_state(&self.hook_ctx.session)
            .await
    }
}
