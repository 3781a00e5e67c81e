//! 叶子单元：模型驱动的 Agent
//!
//! 每一步：渲染指令 -> 以压缩视图构造 TurnRequest -> 调用 TurnProducer -> 追加回复事件 -> 依次执行工具调用。
//! 直到模型给出不含工具调用的回复，或超过 max_steps（报错）。
//! 工具调用先经过确认控制器的审批门；需要确认时追加待审批事件并挂起。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::{json, Value};

use crate::agent::{InvocationContext, ResumeTarget, TurnUnit, UnitFailure, UnitOutcome};
use crate::confirmation::{Approval, ConfirmationController};
use crate::core::{AgentError, ErrorInfo};
use crate::llm::{TurnProducer, TurnRequest};
use crate::memory::MemorySnippet;
use crate::session::{Event, Message, State, StateDelta, ToolCall, ToolResult, USER_AUTHOR};
use crate::tools::{ToolContext, ToolExecutor};

/// 默认最大步数，防止死循环
pub const DEFAULT_MAX_STEPS: usize = 20;

/// 指令占位符：`{key}` 必需，`{key?}` 可选；key 可带作用域前缀如 `user:name`
fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_:]*)(\?)?\}").ok())
        .as_ref()
}

/// 用 State 渲染指令模板；缺少必需 key 时返回该 key
pub fn render_instruction(template: &str, state: &State) -> Result<String, String> {
    let Some(re) = placeholder() else {
        return Ok(template.to_string());
    };
    let mut missing: Option<String> = None;
    let rendered = re.replace_all(template, |caps: &Captures| {
        let key = &caps[1];
        match state.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None if caps.get(2).is_some() => String::new(),
            Some(Value::Null) | None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
            Some(other) => other.to_string(),
        }
    });
    match missing {
        Some(key) => Err(key),
        None => Ok(rendered.into_owned()),
    }
}

/// 一批工具调用的处理结果
enum Step {
    Continue,
    Suspended,
    Terminated,
}

enum CallOutcome {
    Done { terminate: bool },
    Suspended,
}

pub struct LeafUnit {
    name: String,
    description: String,
    instruction: String,
    producer: Arc<dyn TurnProducer>,
    executor: Option<Arc<ToolExecutor>>,
    output_key: Option<String>,
    max_steps: usize,
    recoverable: bool,
    preload_memory: bool,
}

impl LeafUnit {
    pub fn new(name: impl Into<String>, producer: Arc<dyn TurnProducer>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: String::new(),
            producer,
            executor: None,
            output_key: None,
            max_steps: DEFAULT_MAX_STEPS,
            recoverable: false,
            preload_memory: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_tools(mut self, executor: Arc<ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 最近一次带文本的回复写入该 State key（包括同时带工具调用的回复）
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// 失败不中止外层 Sequential / Loop
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// 每回合前按用户输入检索长期记忆
    pub fn with_preload_memory(mut self, preload: bool) -> Self {
        self.preload_memory = preload;
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    async fn fail(&self, ctx: &mut InvocationContext, error: AgentError) -> UnitFailure {
        // 缺少输入 key 与取消总是致命
        let recoverable = self.recoverable
            && !matches!(error, AgentError::MissingStateKey { .. } | AgentError::Cancelled);
        ctx.fail(&self.name, error, recoverable).await
    }

    /// 历史事件转为本单元可见的消息
    fn to_message(&self, event: &Event) -> Option<Message> {
        if let Some(record) = &event.actions.compaction {
            return Some(Message::user(format!(
                "Summary of earlier conversation:\n{}",
                record.summary
            )));
        }
        if event.actions.confirmation_request.is_some()
            || event.actions.confirmation_response.is_some()
        {
            return None;
        }
        let content = event.content.as_ref()?;
        if event.author == USER_AUTHOR || event.author == self.name {
            return Some(content.clone());
        }
        // 其他单元的输出只保留文本
        let text = content.text();
        if text.trim().is_empty() {
            None
        } else {
            Some(Message::user(format!("[{}] said: {}", event.author, text)))
        }
    }

    async fn preload(&self, ctx: &InvocationContext) -> Vec<MemorySnippet> {
        if !self.preload_memory {
            return Vec::new();
        }
        let (Some(memory), Some(query)) = (ctx.memory(), ctx.user_content.as_ref().map(Message::text))
        else {
            return Vec::new();
        };
        match memory
            .search_memory(&ctx.session.app_name, &ctx.session.user_id, &query)
            .await
        {
            Ok(snippets) => snippets,
            Err(e) => {
                tracing::warn!(unit = %self.name, error = %e, "memory preload failed");
                Vec::new()
            }
        }
    }

    async fn build_request(&self, ctx: &InvocationContext) -> Result<TurnRequest, AgentError> {
        let instruction = render_instruction(&self.instruction, &ctx.state).map_err(|key| {
            AgentError::MissingStateKey {
                unit: self.name.clone(),
                key,
            }
        })?;
        let contents = ctx
            .context_events()
            .await?
            .iter()
            .filter_map(|e| self.to_message(e))
            .collect();
        let tools = self
            .executor
            .as_ref()
            .map(|executor| executor.declarations())
            .unwrap_or_default();
        Ok(TurnRequest {
            unit: self.name.clone(),
            instruction,
            contents,
            tools,
            state: ctx.state.clone(),
            memory: self.preload(ctx).await,
        })
    }

    /// 依次执行一批调用；resolved 为恢复时被审批的调用 id 及其决定
    async fn run_calls(
        &self,
        ctx: &mut InvocationContext,
        calls: &[ToolCall],
        resolved: Option<(&str, bool)>,
    ) -> Result<Step, UnitFailure> {
        let mut terminate = false;
        for call in calls {
            let decision = resolved
                .filter(|(id, _)| *id == call.id)
                .map(|(_, decision)| decision);
            match self.run_call(ctx, call, decision).await? {
                CallOutcome::Suspended => return Ok(Step::Suspended),
                CallOutcome::Done { terminate: t } => terminate |= t,
            }
        }
        Ok(if terminate { Step::Terminated } else { Step::Continue })
    }

    async fn run_call(
        &self,
        ctx: &mut InvocationContext,
        call: &ToolCall,
        decision: Option<bool>,
    ) -> Result<CallOutcome, UnitFailure> {
        let Some(executor) = self.executor.clone() else {
            return self
                .tool_error(ctx, call, AgentError::UnknownTool(call.name.clone()))
                .await;
        };
        let tool = match executor.prepare(call) {
            Ok(tool) => tool,
            Err(e) => return self.tool_error(ctx, call, e).await,
        };

        let controller = ctx.controller();
        if let Approval::Required { hint, payload } = controller.evaluate(call) {
            match decision {
                None => {
                    return self
                        .suspend(ctx, &controller, hint, payload, call, StateDelta::new())
                        .await
                }
                Some(false) => {
                    tracing::info!(
                        invocation_id = %ctx.invocation_id,
                        unit = %self.name,
                        tool = %call.name,
                        "tool call rejected"
                    );
                    let result = json!({ "status": "rejected", "tool": call.name });
                    self.emit_result(ctx, call, result, StateDelta::new(), false)
                        .await?;
                    return Ok(CallOutcome::Done { terminate: false });
                }
                Some(true) => {}
            }
        }

        let mut tool_ctx = ToolContext::new(
            ctx.session.clone(),
            ctx.invocation_id.clone(),
            self.name.clone(),
            ctx.state.clone(),
        )
        .with_decision(decision)
        .with_memory(ctx.memory())
        .with_services(ctx.services().clone(), ctx.cancel_token());

        match executor.execute(&tool, call.args.clone(), &mut tool_ctx).await {
            Ok(response) => {
                let delta = tool_ctx.take_delta();
                if let Some(ask) = tool_ctx.take_confirmation() {
                    if decision.is_none() {
                        return self
                            .suspend(ctx, &controller, ask.hint, ask.payload, call, delta)
                            .await;
                    }
                }
                let terminate = tool_ctx.terminated();
                self.emit_result(ctx, call, response, delta, terminate).await?;
                Ok(CallOutcome::Done { terminate })
            }
            Err(e) => self.tool_error(ctx, call, e).await,
        }
    }

    async fn suspend(
        &self,
        ctx: &mut InvocationContext,
        controller: &ConfirmationController,
        hint: String,
        payload: Value,
        call: &ToolCall,
        delta: StateDelta,
    ) -> Result<CallOutcome, UnitFailure> {
        let event = controller
            .request_event(
                &self.name,
                &ctx.branch,
                &ctx.invocation_id,
                hint,
                payload,
                Some(call.clone()),
            )
            .with_delta(delta);
        let stored = ctx.emit_for(&self.name, event).await?;
        tracing::info!(
            invocation_id = %ctx.invocation_id,
            unit = %self.name,
            tool = %call.name,
            approval_id = stored
                .actions
                .confirmation_request
                .as_ref()
                .map(|r| r.approval_id.as_str())
                .unwrap_or_default(),
            "tool call awaiting confirmation"
        );
        Ok(CallOutcome::Suspended)
    }

    async fn emit_result(
        &self,
        ctx: &mut InvocationContext,
        call: &ToolCall,
        response: Value,
        delta: StateDelta,
        terminate: bool,
    ) -> Result<Event, UnitFailure> {
        let mut event = Event::new(&self.name)
            .with_content(Message::tool_result(ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                response,
            }))
            .with_delta(delta);
        if terminate {
            event = event.with_terminate();
        }
        ctx.emit_for(&self.name, event).await
    }

    /// 工具错误作为结果交还模型，不中止单元
    async fn tool_error(
        &self,
        ctx: &mut InvocationContext,
        call: &ToolCall,
        error: AgentError,
    ) -> Result<CallOutcome, UnitFailure> {
        tracing::warn!(
            invocation_id = %ctx.invocation_id,
            unit = %self.name,
            tool = %call.name,
            error = %error,
            "tool call failed"
        );
        let event = Event::new(&self.name)
            .with_content(Message::tool_result(ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                response: json!({ "status": "error", "error": error.to_string() }),
            }))
            .with_error(ErrorInfo::from_error(&error));
        ctx.emit_for(&self.name, event).await?;
        Ok(CallOutcome::Done { terminate: false })
    }

    /// 恢复：只执行最近一次回复中尚未得到结果的调用
    async fn resume_calls(
        &self,
        ctx: &mut InvocationContext,
        target: ResumeTarget,
    ) -> Result<Step, UnitFailure> {
        let events = ctx
            .invocation_events()
            .await
            .map_err(|e| UnitFailure::new(&self.name, e, false))?;
        let mine: Vec<&Event> = events.iter().filter(|e| e.branch == ctx.branch).collect();
        let Some(pos) = mine
            .iter()
            .rposition(|e| e.author == self.name && !e.tool_calls().is_empty())
        else {
            return Ok(Step::Continue);
        };
        let answered: HashSet<String> = mine[pos + 1..]
            .iter()
            .filter_map(|e| e.content.as_ref())
            .flat_map(|m| m.results())
            .map(|r| r.id)
            .collect();
        let calls: Vec<ToolCall> = mine[pos]
            .tool_calls()
            .into_iter()
            .filter(|c| !answered.contains(&c.id))
            .collect();
        let approved = target.request.tool_call.as_ref().map(|c| c.id.clone());
        tracing::debug!(
            invocation_id = %ctx.invocation_id,
            unit = %self.name,
            pending_calls = calls.len(),
            "resuming tool calls"
        );
        self.run_calls(ctx, &calls, approved.as_deref().zip(target.decision))
            .await
    }
}

#[async_trait]
impl TurnUnit for LeafUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut InvocationContext) -> Result<UnitOutcome, UnitFailure> {
        if let Some(target) = ctx.take_resume_for_self() {
            match self.resume_calls(ctx, target).await? {
                Step::Suspended => return Ok(UnitOutcome::Suspended),
                Step::Terminated => return Ok(UnitOutcome::Terminated),
                Step::Continue => {}
            }
        }

        let mut steps = 0;
        loop {
            ctx.check_cancelled(&self.name).await?;
            steps += 1;
            if steps > self.max_steps {
                let error = AgentError::StepLimitExceeded(self.name.clone());
                return Err(self.fail(ctx, error).await);
            }

            let request = match self.build_request(ctx).await {
                Ok(request) => request,
                Err(e) => return Err(self.fail(ctx, e).await),
            };
            let reply = match self.producer.produce(&request).await {
                Ok(reply) => reply,
                Err(e) => return Err(self.fail(ctx, AgentError::Model(e)).await),
            };

            let calls = reply.calls();
            // 带调用的回复只在有文本时写 output_key
            let write_output = calls.is_empty() || !reply.text().trim().is_empty();
            let mut event = Event::new(&self.name).with_content(reply);
            if let Some(key) = self.output_key.as_ref().filter(|_| write_output) {
                let mut delta = StateDelta::new();
                delta.set(key.clone(), event.text());
                event = event.with_delta(delta);
            }
            if calls.is_empty() {
                ctx.emit_for(&self.name, event).await?;
                tracing::debug!(invocation_id = %ctx.invocation_id, unit = %self.name, steps, "leaf finished");
                return Ok(UnitOutcome::Completed);
            }
            ctx.emit_for(&self.name, event).await?;

            match self.run_calls(ctx, &calls, None).await? {
                Step::Suspended => return Ok(UnitOutcome::Suspended),
                Step::Terminated => return Ok(UnitOutcome::Terminated),
                Step::Continue => {}
            }
        }
    }
}
