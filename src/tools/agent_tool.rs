//! AgentTool：把一个单元包装成工具
//!
//! 调用方模型以 `{"request": "..."}` 调用；子单元在独立上下文中运行，只看到这条请求和调用时的状态快照。
//! 子单元写入的状态增量并入工具结果事件，最后一条回复文本作为工具结果返回。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::{InvocationContext, TurnUnit, Unit, UnitOutcome};
use crate::session::{Message, USER_AUTHOR};
use crate::tools::{schema_of, Tool, ToolContext};

#[derive(Debug, Deserialize, JsonSchema)]
struct AgentToolArgs {
    /// 交给子单元的请求
    request: String,
}

pub struct AgentTool {
    unit: Arc<Unit>,
    description: String,
}

impl AgentTool {
    pub fn new(unit: impl Into<Unit>) -> Self {
        let unit = unit.into();
        let description = format!(
            "Delegate a request to the {} agent and return its answer. Args: {{\"request\": \"...\"}}",
            unit.name()
        );
        Self {
            unit: Arc::new(unit),
            description,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        self.unit.name()
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<AgentToolArgs>()
    }

    async fn execute(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, String> {
        let args: AgentToolArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let (services, cancel) = ctx
            .services()
            .ok_or_else(|| format!("{} must be called from a running unit", self.unit.name()))?;

        let mut sub = InvocationContext::detached(
            ctx.invocation_id.clone(),
            ctx.session.clone(),
            Message::user(args.request),
            ctx.state(),
            cancel,
            services,
        );
        sub.set_branch(format!("{}.{}", ctx.unit, self.unit.name()));
        let outcome = self.unit.run(&mut sub).await;
        let events = sub.into_buffer();

        match outcome {
            Ok(UnitOutcome::Suspended) => {
                return Err(format!(
                    "{} requested confirmation, which is not supported inside a tool call",
                    self.unit.name()
                ))
            }
            Err(failure) => return Err(failure.error.to_string()),
            Ok(_) => {}
        }

        for event in &events {
            for (key, value) in event.actions.state_delta.iter() {
                ctx.set_state(key.clone(), value.clone());
            }
        }
        let answer = events
            .iter()
            .rev()
            .filter(|e| e.author != USER_AUTHOR)
            .map(|e| e.text())
            .find(|text| !text.trim().is_empty())
            .unwrap_or_default();
        tracing::debug!(
            invocation_id = %ctx.invocation_id,
            unit = %ctx.unit,
            agent = %self.unit.name(),
            events = events.len(),
            "agent tool finished"
        );
        Ok(json!({ "status": "success", "result": answer }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{LeafUnit, Services};
    use crate::confirmation::ConfirmationController;
    use crate::llm::{FnProducer, ScriptedProducer, TurnRequest};
    use crate::session::{InMemorySessionService, SessionKey, State};
    use tokio_util::sync::CancellationToken;

    fn tool_ctx() -> ToolContext {
        let services = Services {
            session_service: Arc::new(InMemorySessionService::new()),
            memory_service: None,
            controller: Arc::new(ConfirmationController::new()),
        };
        ToolContext::new(SessionKey::new("app", "u1", "s1"), "inv_1", "coordinator", State::new())
            .with_services(services, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_runs_unit_and_returns_final_text() {
        let researcher = LeafUnit::new(
            "researcher",
            Arc::new(FnProducer::new(|req: &TurnRequest| {
                let question = req.last_user_text().unwrap_or_default();
                Ok(Message::model(format!("findings on {question}")))
            })),
        )
        .with_output_key("research_findings");
        let tool = AgentTool::new(researcher);
        assert_eq!(tool.name(), "researcher");

        let mut ctx = tool_ctx();
        let out = tool
            .execute(json!({ "request": "tidal power" }), &mut ctx)
            .await
            .unwrap();
        assert_eq!(out["result"], "findings on tidal power");
        // 子单元的 output_key 写入随工具结果一起提交
        assert_eq!(
            ctx.get_state("research_findings"),
            Some(json!("findings on tidal power"))
        );
    }

    #[tokio::test]
    async fn test_failed_unit_becomes_tool_error() {
        let broken = LeafUnit::new("summarizer", Arc::new(ScriptedProducer::text("unused")))
            .with_instruction("Summarize {research_findings}");
        let tool = AgentTool::new(broken);
        let err = tool
            .execute(json!({ "request": "go" }), &mut tool_ctx())
            .await
            .unwrap_err();
        assert!(err.contains("research_findings"));
    }

    #[tokio::test]
    async fn test_requires_running_unit() {
        let tool = AgentTool::new(LeafUnit::new("helper", Arc::new(ScriptedProducer::text("hi"))));
        let mut ctx =
            ToolContext::new(SessionKey::new("app", "u1", "s1"), "inv_1", "caller", State::new());
        assert!(tool.execute(json!({ "request": "x" }), &mut ctx).await.is_err());
    }
}
