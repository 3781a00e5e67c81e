//! Runner：把一条入站消息驱动为一次 Invocation
//!
//! run：必要时创建会话，登记 Invocation，追加用户事件，在根单元上执行。
//! resume：校验审批响应后追加响应事件，带着恢复目标重新进入根单元。
//! 结束（完成或失败）时清理 temp: 分区并调用 after_invocation 钩子；挂起时只更新状态，等待下一次 resume。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::agent::{InvocationContext, ResumeTarget, Services, TurnUnit, Unit, UnitFailure, UnitOutcome};
use crate::compaction::{CompactionEngine, DigestSummarizer};
use crate::config::AppConfig;
use crate::confirmation::{pending_invocation, response_from_message, ConfirmationController};
use crate::core::{AgentError, Invocation, InvocationStatus, SessionSupervisor};
use crate::memory::{AutoSaveMemory, InMemoryMemoryService, MemoryService};
use crate::runner::{EventLog, LoggingPlugin, RunnerHook};
use crate::session::{
    ConfirmationRequest, ConfirmationResponse, Event, InMemorySessionService,
    JsonFileSessionService, Message, SessionKey, SessionService, USER_AUTHOR,
};

/// Runner 自身追加的事件（如 temp: 清理）的作者名
pub const RUNNER_AUTHOR: &str = "runner";

/// 一次 run / resume 的结果
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub invocation_id: String,
    pub status: InvocationStatus,
    /// 本次调用追加的事件（含用户事件与派生事件）
    pub events: Vec<Event>,
    pub error: Option<AgentError>,
}

impl RunOutcome {
    /// 最后一条单元回复的文本
    pub fn final_text(&self) -> Option<String> {
        self.events
            .iter()
            .rev()
            .filter(|e| e.author != USER_AUTHOR && e.author != RUNNER_AUTHOR)
            .find_map(|e| e.content.as_ref().filter(|m| m.has_text()).map(Message::text))
    }

    /// 挂起时等待的审批请求
    pub fn pending(&self) -> Option<&ConfirmationRequest> {
        if self.status != InvocationStatus::Suspended {
            return None;
        }
        self.events
            .iter()
            .rev()
            .find_map(|e| e.actions.confirmation_request.as_ref())
    }
}

pub struct Runner {
    app_name: String,
    root: Arc<Unit>,
    session_service: Arc<dyn SessionService>,
    memory_service: Option<Arc<dyn MemoryService>>,
    controller: Arc<ConfirmationController>,
    supervisor: SessionSupervisor,
    hooks: Vec<Arc<dyn RunnerHook>>,
}

impl Runner {
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::default()
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn session_service(&self) -> Arc<dyn SessionService> {
        self.session_service.clone()
    }

    pub fn controller(&self) -> Arc<ConfirmationController> {
        self.controller.clone()
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    pub async fn run(
        &self,
        user_id: &str,
        session_id: &str,
        message: Message,
    ) -> Result<RunOutcome, AgentError> {
        self.run_with_events(user_id, session_id, message, None).await
    }

    /// 执行一条入站消息；tx 可选，用于流式观察追加的事件。
    /// 消息若是对未决审批的回复，则转为 resume。
    pub async fn run_with_events(
        &self,
        user_id: &str,
        session_id: &str,
        message: Message,
        tx: Option<mpsc::UnboundedSender<Event>>,
    ) -> Result<RunOutcome, AgentError> {
        if let Some((approval_id, confirmed)) = response_from_message(&message) {
            let invocation_id = match self.controller.find_by_approval(&approval_id).await {
                Some(id) => id,
                None => self
                    .restore_by_approval(user_id, session_id, &approval_id)
                    .await?
                    .ok_or_else(|| AgentError::ConfirmationMismatch {
                        expected: None,
                        got: approval_id.clone(),
                    })?,
            };
            let response = ConfirmationResponse {
                approval_id,
                invocation_id,
                confirmed,
            };
            return self.resume_with_events(response, tx).await;
        }

        let key = self.ensure_session(user_id, session_id).await?;
        let invocation = Invocation::new(key.clone());
        let invocation_id = invocation.id.clone();
        self.controller.begin(invocation).await;
        let cancel = self.supervisor.register(&invocation_id).await;
        let log = self.event_log(&key, &invocation_id, tx);
        tracing::info!(invocation_id = %invocation_id, session = %key, "invocation started");

        let user_event = Event::new(USER_AUTHOR)
            .with_invocation(invocation_id.clone())
            .with_branch(self.root.name())
            .with_content(message.clone());
        if let Err(e) = log.append(user_event).await {
            return self.abort(&invocation_id, e).await;
        }
        let state = match log.state().await {
            Ok(state) => state,
            Err(e) => return self.abort(&invocation_id, e).await,
        };

        let mut ctx = InvocationContext::new(
            invocation_id.clone(),
            key,
            Some(message),
            state,
            log.clone(),
            cancel,
            self.services(),
        );
        ctx.set_branch(self.root.name().to_string());
        let result = self.root.run(&mut ctx).await;
        self.finish(&invocation_id, &log, result).await
    }

    pub async fn resume(&self, response: ConfirmationResponse) -> Result<RunOutcome, AgentError> {
        self.resume_with_events(response, None).await
    }

    /// 用外部决定恢复挂起的 Invocation；过期 approval id 被拒绝，Invocation 保持挂起
    pub async fn resume_with_events(
        &self,
        response: ConfirmationResponse,
        tx: Option<mpsc::UnboundedSender<Event>>,
    ) -> Result<RunOutcome, AgentError> {
        let invocation_id = response.invocation_id.clone();
        let request = self.controller.resume(&response).await?;
        let key = self
            .controller
            .session_of(&invocation_id)
            .await
            .ok_or_else(|| AgentError::InvocationNotFound(invocation_id.clone()))?;
        let cancel = self.supervisor.register(&invocation_id).await;
        let log = self.event_log(&key, &invocation_id, tx);
        tracing::info!(
            invocation_id = %invocation_id,
            approval_id = %response.approval_id,
            confirmed = response.confirmed,
            "invocation resumed"
        );

        let response_event = Event::new(USER_AUTHOR)
            .with_invocation(invocation_id.clone())
            .with_branch(request.branch.clone())
            .with_confirmation_response(response.clone());
        if let Err(e) = log.append(response_event).await {
            return self.abort(&invocation_id, e).await;
        }
        let (history, state) = match (log.history().await, log.state().await) {
            (Ok(history), Ok(state)) => (history, state),
            (Err(e), _) | (_, Err(e)) => return self.abort(&invocation_id, e).await,
        };
        let user_content = history
            .iter()
            .find(|e| e.invocation_id == invocation_id && e.author == USER_AUTHOR && e.content.is_some())
            .and_then(|e| e.content.clone());

        let mut ctx = InvocationContext::new(
            invocation_id.clone(),
            key,
            user_content,
            state,
            log.clone(),
            cancel,
            self.services(),
        );
        ctx.set_branch(self.root.name().to_string());
        ctx.set_resume(Some(ResumeTarget {
            branch: request.branch.clone(),
            request,
            decision: Some(response.confirmed),
        }));
        let result = self.root.run(&mut ctx).await;
        self.finish(&invocation_id, &log, result).await
    }

    /// 指定会话的恢复：注册表中没有该 Invocation 时（如进程重启后）先从会话日志重建
    pub async fn resume_in(
        &self,
        user_id: &str,
        session_id: &str,
        response: ConfirmationResponse,
    ) -> Result<RunOutcome, AgentError> {
        if self.controller.session_of(&response.invocation_id).await.is_none() {
            let key = SessionKey::new(self.app_name.as_str(), user_id, session_id);
            let session = self
                .session_service
                .get_session(&key)
                .await?
                .ok_or_else(|| AgentError::InvocationNotFound(response.invocation_id.clone()))?;
            self.controller
                .restore(key, &session.events, &response.invocation_id)
                .await?;
        }
        self.resume_with_events(response, None).await
    }

    /// 按 approval id 在会话日志中查找并重建挂起的 Invocation
    async fn restore_by_approval(
        &self,
        user_id: &str,
        session_id: &str,
        approval_id: &str,
    ) -> Result<Option<String>, AgentError> {
        let key = SessionKey::new(self.app_name.as_str(), user_id, session_id);
        let Some(session) = self.session_service.get_session(&key).await? else {
            return Ok(None);
        };
        let Some(invocation_id) = pending_invocation(&session.events, approval_id) else {
            return Ok(None);
        };
        self.controller
            .restore(key, &session.events, &invocation_id)
            .await?;
        Ok(Some(invocation_id))
    }

    /// 取消运行中的 Invocation；已追加的增量保留
    pub async fn cancel(&self, invocation_id: &str) -> bool {
        let cancelled = self.supervisor.cancel(invocation_id).await;
        if cancelled {
            tracing::info!(invocation_id, "invocation cancel requested");
        }
        cancelled
    }

    fn services(&self) -> Services {
        Services {
            session_service: self.session_service.clone(),
            memory_service: self.memory_service.clone(),
            controller: self.controller.clone(),
        }
    }

    fn event_log(
        &self,
        key: &SessionKey,
        invocation_id: &str,
        tx: Option<mpsc::UnboundedSender<Event>>,
    ) -> Arc<EventLog> {
        Arc::new(EventLog::new(
            self.session_service.clone(),
            key.clone(),
            invocation_id,
            self.controller.clone(),
            self.hooks.clone(),
            tx,
        ))
    }

    async fn ensure_session(&self, user_id: &str, session_id: &str) -> Result<SessionKey, AgentError> {
        let key = SessionKey::new(self.app_name.as_str(), user_id, session_id);
        if self.session_service.get_session(&key).await?.is_none() {
            self.session_service
                .create_session(&self.app_name, user_id, Some(session_id))
                .await?;
        }
        Ok(key)
    }

    /// 运行前的存储错误：标记失败并返回错误
    async fn abort(&self, invocation_id: &str, error: AgentError) -> Result<RunOutcome, AgentError> {
        self.supervisor.release(invocation_id).await;
        if let Err(e) = self.controller.fail(invocation_id).await {
            tracing::warn!(invocation_id, error = %e, "failed to mark invocation failed");
        }
        tracing::error!(invocation_id, error = %error, "invocation aborted");
        Err(error)
    }

    async fn finish(
        &self,
        invocation_id: &str,
        log: &EventLog,
        result: Result<UnitOutcome, UnitFailure>,
    ) -> Result<RunOutcome, AgentError> {
        self.supervisor.release(invocation_id).await;
        let (status, error) = match result {
            Ok(UnitOutcome::Suspended) => (InvocationStatus::Suspended, None),
            Ok(_) => (InvocationStatus::Completed, None),
            Err(failure) => (InvocationStatus::Failed, Some(failure.error)),
        };

        if status == InvocationStatus::Suspended {
            self.controller.suspend(invocation_id).await?;
            tracing::info!(invocation_id, "invocation suspended awaiting confirmation");
        } else {
            // temp: 分区只在一次 Invocation 内有效
            let clear = log.state().await?.clear_temp_delta();
            if !clear.is_empty() {
                let event = Event::new(RUNNER_AUTHOR)
                    .with_invocation(invocation_id)
                    .with_branch(self.root.name())
                    .with_delta(clear);
                log.append(event).await?;
            }
            if status == InvocationStatus::Completed {
                self.controller.complete(invocation_id).await?;
            } else {
                self.controller.fail(invocation_id).await?;
            }
            for hook in &self.hooks {
                if let Err(e) = hook.after_invocation(log.hook_context(), status).await {
                    tracing::warn!(invocation_id, hook = hook.name(), error = %e, "after_invocation hook failed");
                }
            }
        }

        Ok(RunOutcome {
            invocation_id: invocation_id.to_string(),
            status,
            events: log.appended().await,
            error,
        })
    }
}

/// Runner 构建器
#[derive(Default)]
pub struct RunnerBuilder {
    app_name: Option<String>,
    root: Option<Unit>,
    session_service: Option<Arc<dyn SessionService>>,
    memory_service: Option<Arc<dyn MemoryService>>,
    controller: Option<ConfirmationController>,
    hooks: Vec<Arc<dyn RunnerHook>>,
}

impl RunnerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置装配：会话存储、长期记忆、审批门、日志钩子与可选的压缩
    pub fn from_config(config: &AppConfig) -> Self {
        let session_service: Arc<dyn SessionService> = match &config.session.store_dir {
            Some(dir) => Arc::new(JsonFileSessionService::new(dir)),
            None => Arc::new(InMemorySessionService::new()),
        };
        let memory: Arc<dyn MemoryService> = Arc::new(InMemoryMemoryService::new(
            config.memory.max_entries,
            config.memory.search_limit,
        ));
        let mut builder = Self::new()
            .with_app_name(config.app.name.clone())
            .with_session_service(session_service)
            .with_memory_service(memory.clone())
            .with_controller(ConfirmationController::from_config(&config.confirmation))
            .with_hook(Arc::new(LoggingPlugin));
        if config.compaction.enabled {
            builder = builder.with_compaction(CompactionEngine::new(
                (&config.compaction).into(),
                Arc::new(DigestSummarizer::default()),
            ));
        }
        builder.with_hook(Arc::new(AutoSaveMemory::new(memory)))
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn with_root(mut self, root: impl Into<Unit>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_session_service(mut self, service: Arc<dyn SessionService>) -> Self {
        self.session_service = Some(service);
        self
    }

    pub fn with_memory_service(mut self, service: Arc<dyn MemoryService>) -> Self {
        self.memory_service = Some(service);
        self
    }

    pub fn with_controller(mut self, controller: ConfirmationController) -> Self {
        self.controller = Some(controller);
        self
    }

    /// 钩子按注册顺序执行
    pub fn with_hook(mut self, hook: Arc<dyn RunnerHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_compaction(self, engine: CompactionEngine) -> Self {
        self.with_hook(Arc::new(engine))
    }

    pub fn build(self) -> Result<Runner, AgentError> {
        let root = self
            .root
            .ok_or_else(|| AgentError::Config("runner requires a root unit".to_string()))?;
        Ok(Runner {
            app_name: self.app_name.unwrap_or_else(|| "hive".to_string()),
            root: Arc::new(root),
            session_service: self
                .session_service
                .unwrap_or_else(|| Arc::new(InMemorySessionService::new())),
            memory_service: self.memory_service,
            controller: Arc::new(self.controller.unwrap_or_default()),
            supervisor: SessionSupervisor::new(),
            hooks: self.hooks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LeafUnit;
    use crate::llm::ScriptedProducer;
    use crate::tools::{Tool, ToolContext, ToolExecutor, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct ScratchTool;

    #[async_trait]
    impl Tool for ScratchTool {
        fn name(&self) -> &str {
            "scratch"
        }

        fn description(&self) -> &str {
            "writes temp and session keys"
        }

        async fn execute(&self, _args: Value, ctx: &mut ToolContext) -> Result<Value, String> {
            ctx.set_state("temp:scratch", "x");
            ctx.set_state("kept", "y");
            Ok(json!({ "status": "success" }))
        }
    }

    fn scratch_leaf() -> LeafUnit {
        let producer = ScriptedProducer::new([
            Message::tool_calls(vec![crate::session::ToolCall::new("scratch", json!({}))]),
            Message::model("done"),
        ]);
        let executor = ToolExecutor::new(ToolRegistry::default().with(ScratchTool), 5);
        LeafUnit::new("assistant", Arc::new(producer)).with_tools(Arc::new(executor))
    }

    #[tokio::test]
    async fn test_build_requires_root() {
        assert!(matches!(Runner::builder().build(), Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_creates_session_and_clears_temp() {
        let runner = Runner::builder().with_root(scratch_leaf()).build().unwrap();
        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();

        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(outcome.final_text().as_deref(), Some("done"));
        assert_eq!(
            runner.controller().status(&outcome.invocation_id).await,
            Some(InvocationStatus::Completed)
        );

        let key = SessionKey::new("hive", "u1", "s1");
        let session = runner.session_service().get_session(&key).await.unwrap().unwrap();
        assert_eq!(session.state.get_str("kept"), Some("y"));
        assert!(session.state.get("temp:scratch").is_none());
        // temp 写入仍留在日志中可供审计
        assert!(session
            .events
            .iter()
            .any(|e| e.actions.state_delta.get("temp:scratch") == Some(&json!("x"))));
    }

    #[tokio::test]
    async fn test_stream_receives_appended_events() {
        let runner = Runner::builder().with_root(scratch_leaf()).build().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = runner
            .run_with_events("u1", "s1", Message::user("go"), Some(tx))
            .await
            .unwrap();
        let mut streamed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            streamed.push(event.id);
        }
        let appended: Vec<String> = outcome.events.iter().map(|e| e.id.clone()).collect();
        assert_eq!(streamed, appended);
        assert_eq!(outcome.events[0].author, USER_AUTHOR);
    }

    #[tokio::test]
    async fn test_unknown_approval_message_rejected() {
        let runner = Runner::builder().with_root(scratch_leaf()).build().unwrap();
        let message = crate::confirmation::confirmation_message("apr_missing", true);
        let err = runner.run("u1", "s1", message).await.unwrap_err();
        assert!(matches!(err, AgentError::ConfirmationMismatch { expected: None, .. }));
    }

    #[tokio::test]
    async fn test_state_replay_matches_live_state() {
        let runner = Runner::builder().with_root(scratch_leaf()).build().unwrap();
        runner.run("u1", "s1", Message::user("go")).await.unwrap();
        let key = SessionKey::new("hive", "u1", "s1");
        let session = runner.session_service().get_session(&key).await.unwrap().unwrap();
        let replayed = crate::session::State::replay(&session.events);
        assert_eq!(replayed.to_flat(), session.state.to_flat());
    }
}
