//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时：prepare 负责按名查找并按 schema 校验参数，
//! execute 在超时内调用工具，超时或失败时转为 AgentError（ToolTimeout / Tool）；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::llm::ToolDeclaration;
use crate::session::ToolCall;
use crate::tools::{validate_args, Tool, ToolContext, ToolRegistry};

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 查找工具并校验参数；未知工具返回 UnknownTool，参数不合法返回 InvalidArguments
    pub fn prepare(&self, call: &ToolCall) -> Result<Arc<dyn Tool>, AgentError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| AgentError::UnknownTool(call.name.clone()))?;
        validate_args(&tool.parameters_schema(), &call.args).map_err(|message| {
            AgentError::InvalidArguments {
                tool: call.name.clone(),
                message,
            }
        })?;
        Ok(tool)
    }

    /// 执行已校验的工具；超时返回 ToolTimeout，工具返回 Err 则转为 Tool；输出 JSON 审计日志
    pub async fn execute(
        &self,
        tool: &Arc<dyn Tool>,
        args: Value,
        ctx: &mut ToolContext,
    ) -> Result<Value, AgentError> {
        let tool_name = tool.name().to_string();
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, tool.execute(args, ctx)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "invocation_id": ctx.invocation_id,
            "unit": ctx.unit,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(message)) => Err(AgentError::Tool {
                tool: tool_name,
                message,
            }),
            Err(_) => Err(AgentError::ToolTimeout(tool_name)),
        }
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.registry.declarations()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
