//! 追加后钩子
//!
//! 显式、有序的钩子列表：每条事件持久追加后依次调用 after_event，Invocation 结束时调用 after_invocation。
//! after_event 返回的派生事件（如压缩摘要）由 EventLog 继续追加。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{AgentError, InvocationStatus};
use crate::session::{Event, SessionKey, SessionService};

/// 钩子可见的上下文
#[derive(Clone)]
pub struct HookContext {
    pub session_service: Arc<dyn SessionService>,
    pub session: SessionKey,
    pub invocation_id: String,
}

#[async_trait]
pub trait RunnerHook: Send + Sync {
    fn name(&self) -> &str;

    async fn after_event(&self, _ctx: &HookContext, _event: &Event) -> Result<Vec<Event>, AgentError> {
        Ok(Vec::new())
    }

    async fn after_invocation(
        &self,
        _ctx: &HookContext,
        _status: InvocationStatus,
    ) -> Result<(), AgentError> {
        Ok(())
    }
}

/// 日志钩子：记录每条事件与 Invocation 结束
#[derive(Debug, Default)]
pub struct LoggingPlugin;

#[async_trait]
impl RunnerHook for LoggingPlugin {
    fn name(&self) -> &str {
        "logging"
    }

    async fn after_event(&self, ctx: &HookContext, event: &Event) -> Result<Vec<Event>, AgentError> {
        let calls: Vec<String> = event.tool_calls().into_iter().map(|c| c.name).collect();
        tracing::info!(
            invocation_id = %ctx.invocation_id,
            author = %event.author,
            branch = %event.branch,
            tool_calls = ?calls,
            delta_keys = event.actions.state_delta.len(),
            pending = event.actions.confirmation_request.is_some(),
            terminate = event.actions.terminate,
            error = ?event.error.as_ref().map(|e| &e.message),
            "event appended"
        );
        Ok(Vec::new())
    }

    async fn after_invocation(
        &self,
        ctx: &HookContext,
        status: InvocationStatus,
    ) -> Result<(), AgentError> {
        tracing::info!(
            invocation_id = %ctx.invocation_id,
            session = %ctx.session,
            ?status,
            "invocation finished"
        );
        Ok(())
    }
}
