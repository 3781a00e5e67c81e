//! 记忆适配器
//!
//! LoadMemoryTool：模型主动按需检索；AutoSaveMemory：Invocation 结束后把会话归档到长期记忆。
//! 回合前预加载由 LeafUnit 的 preload_memory 负责。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::{AgentError, InvocationStatus};
use crate::memory::MemoryService;
use crate::runner::{HookContext, RunnerHook};
use crate::tools::{schema_of, Tool, ToolContext};

pub const LOAD_MEMORY: &str = "load_memory";

#[derive(Debug, Deserialize, JsonSchema)]
struct LoadMemoryArgs {
    /// 检索关键词
    query: String,
}

/// 检索当前用户的长期记忆
pub struct LoadMemoryTool;

#[async_trait]
impl Tool for LoadMemoryTool {
    fn name(&self) -> &str {
        LOAD_MEMORY
    }

    fn description(&self) -> &str {
        "Search the user's long-term memory of earlier sessions. Args: {\"query\": \"keywords\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<LoadMemoryArgs>()
    }

    async fn execute(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, String> {
        let args: LoadMemoryArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let memory = ctx
            .memory()
            .ok_or_else(|| "no memory service configured".to_string())?;
        let snippets = memory
            .search_memory(&ctx.session.app_name, &ctx.session.user_id, &args.query)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "status": "success", "memories": snippets }))
    }
}

/// Invocation 完成后自动归档会话
pub struct AutoSaveMemory {
    memory: Arc<dyn MemoryService>,
}

impl AutoSaveMemory {
    pub fn new(memory: Arc<dyn MemoryService>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl RunnerHook for AutoSaveMemory {
    fn name(&self) -> &str {
        "auto_save_memory"
    }

    async fn after_invocation(
        &self,
        ctx: &HookContext,
        status: InvocationStatus,
    ) -> Result<(), AgentError> {
        if status != InvocationStatus::Completed {
            return Ok(());
        }
        let Some(session) = ctx.session_service.get_session(&ctx.session).await? else {
            return Ok(());
        };
        self.memory.add_session_to_memory(&session).await?;
        tracing::debug!(session = %ctx.session, "session saved to memory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMemoryService;
    use crate::session::{Event, InMemorySessionService, Message, SessionService, State};

    #[tokio::test]
    async fn test_auto_save_then_load_memory() {
        let sessions = Arc::new(InMemorySessionService::default());
        let session = sessions.create_session("app", "u1", None).await.unwrap();
        sessions
            .append_event(
                &session.key,
                Event::new("user").with_content(Message::user("my favourite colour is teal")),
            )
            .await
            .unwrap();

        let memory: Arc<dyn MemoryService> = Arc::new(InMemoryMemoryService::default());
        let hook = AutoSaveMemory::new(memory.clone());
        let ctx = HookContext {
            session_service: sessions.clone(),
            session: session.key.clone(),
            invocation_id: "inv_1".to_string(),
        };
        hook.after_invocation(&ctx, InvocationStatus::Completed)
            .await
            .unwrap();

        let mut tool_ctx = ToolContext::new(session.key.clone(), "inv_2", "assistant", State::new())
            .with_memory(Some(memory));
        let result = LoadMemoryTool
            .execute(json!({ "query": "favourite colour" }), &mut tool_ctx)
            .await
            .unwrap();
        let memories = result["memories"].as_array().unwrap();
        assert_eq!(memories.len(), 1);
        assert!(memories[0]["text"].as_str().unwrap().contains("teal"));
    }

    #[tokio::test]
    async fn test_load_memory_without_service_errors() {
        let key = crate::session::SessionKey::new("app", "u1", "s1");
        let mut tool_ctx = ToolContext::new(key, "inv", "assistant", State::new());
        let err = LoadMemoryTool
            .execute(json!({ "query": "x" }), &mut tool_ctx)
            .await
            .unwrap_err();
        assert!(err.contains("memory"));
    }
}
