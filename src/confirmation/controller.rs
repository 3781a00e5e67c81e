//! 确认 / 恢复控制器
//!
//! 维护按工具名注册的审批门与 Invocation 注册表。
//! 审批请求事件追加后由 observe 记录为「最近的未决请求」；resume 只接受与之匹配的 approval id，
//! 过期或未知的 id 被拒绝，Invocation 保持 Suspended。
//! 注册表只保存运行中与挂起的 Invocation；结束的只在有界历史中保留状态。
//! 进程重启后，挂起的 Invocation 可由 restore 从会话日志重建。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::ConfirmationSection;
use crate::confirmation::{Approval, ApprovalGate, ThresholdGate};
use crate::core::{AgentError, Invocation, InvocationId, InvocationStatus};
use crate::session::{
    ConfirmationRequest, ConfirmationResponse, Event, Message, Part, SessionKey, ToolCall,
    ToolResult,
};

/// 入站消息中审批响应片段的名称：`{"type":"tool_result","id":<approval_id>,"name":"request_confirmation","response":{"confirmed":true}}`
pub const REQUEST_CONFIRMATION: &str = "request_confirmation";

/// 保留的已结束 Invocation 状态条数
pub const DEFAULT_FINISHED_HISTORY: usize = 256;

pub struct ConfirmationController {
    gates: HashMap<String, Arc<dyn ApprovalGate>>,
    invocations: RwLock<HashMap<InvocationId, Invocation>>,
    finished: RwLock<VecDeque<(InvocationId, InvocationStatus)>>,
    finished_limit: usize,
}

impl Default for ConfirmationController {
    fn default() -> Self {
        Self {
            gates: HashMap::new(),
            invocations: RwLock::new(HashMap::new()),
            finished: RwLock::new(VecDeque::new()),
            finished_limit: DEFAULT_FINISHED_HISTORY,
        }
    }
}

impl ConfirmationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_finished_limit(mut self, limit: usize) -> Self {
        self.finished_limit = limit;
        self
    }

    /// 为指定工具注册审批门
    pub fn with_gate(mut self, tool: impl Into<String>, gate: impl ApprovalGate + 'static) -> Self {
        self.gates.insert(tool.into(), Arc::new(gate));
        self
    }

    pub fn from_config(section: &ConfirmationSection) -> Self {
        section.gates.iter().fold(Self::new(), |controller, g| {
            controller.with_gate(g.tool.clone(), ThresholdGate::new(g.field.clone(), g.threshold))
        })
    }

    /// 对工具调用求值；没有注册门的工具自动通过
    pub fn evaluate(&self, call: &ToolCall) -> Approval {
        self.gates
            .get(&call.name)
            .map(|gate| gate.evaluate(call))
            .unwrap_or(Approval::Auto)
    }

    /// 构造待审批事件（不含 content，只携带 confirmation_request）
    pub fn request_event(
        &self,
        author: &str,
        branch: &str,
        invocation_id: &str,
        hint: String,
        payload: Value,
        tool_call: Option<ToolCall>,
    ) -> Event {
        let request = ConfirmationRequest {
            approval_id: format!("apr_{}", uuid::Uuid::new_v4()),
            invocation_id: invocation_id.to_string(),
            hint,
            payload,
            tool_call,
            branch: branch.to_string(),
        };
        Event::new(author)
            .with_invocation(invocation_id)
            .with_branch(branch)
            .with_confirmation_request(request)
    }

    /// 登记新的 Invocation
    pub async fn begin(&self, invocation: Invocation) {
        self.invocations
            .write()
            .await
            .insert(invocation.id.clone(), invocation);
    }

    /// 事件追加后调用：记录最近发出的审批请求
    pub async fn observe(&self, event: &Event) {
        if let Some(request) = &event.actions.confirmation_request {
            if let Some(inv) = self
                .invocations
                .write()
                .await
                .get_mut(&request.invocation_id)
            {
                tracing::info!(
                    invocation_id = %inv.id,
                    approval_id = %request.approval_id,
                    branch = %request.branch,
                    "confirmation requested"
                );
                inv.record_request(request.clone());
            }
        }
    }

    pub async fn suspend(&self, invocation_id: &str) -> Result<(), AgentError> {
        self.with_invocation(invocation_id, Invocation::suspend).await
    }

    pub async fn complete(&self, invocation_id: &str) -> Result<(), AgentError> {
        self.retire(invocation_id, Invocation::complete).await
    }

    pub async fn fail(&self, invocation_id: &str) -> Result<(), AgentError> {
        self.retire(invocation_id, Invocation::fail).await
    }

    /// 结束 Invocation：移出注册表，状态进入有界历史
    async fn retire(
        &self,
        invocation_id: &str,
        f: impl FnOnce(&mut Invocation) -> Result<(), AgentError>,
    ) -> Result<(), AgentError> {
        let inv = {
            let mut invocations = self.invocations.write().await;
            let inv = invocations
                .get_mut(invocation_id)
                .ok_or_else(|| AgentError::InvocationNotFound(invocation_id.to_string()))?;
            f(inv)?;
            invocations.remove(invocation_id)
        };
        if let Some(inv) = inv {
            let mut finished = self.finished.write().await;
            finished.push_back((inv.id, inv.status));
            while finished.len() > self.finished_limit {
                finished.pop_front();
            }
        }
        Ok(())
    }

    /// 从会话日志重建挂起的 Invocation；已在注册表中时不做任何事
    pub async fn restore(
        &self,
        session: SessionKey,
        events: &[Event],
        invocation_id: &str,
    ) -> Result<(), AgentError> {
        if self.invocations.read().await.contains_key(invocation_id) {
            return Ok(());
        }
        let own: Vec<&Event> = events
            .iter()
            .filter(|e| e.invocation_id == invocation_id)
            .collect();
        let Some(first) = own.first() else {
            return Err(AgentError::InvocationNotFound(invocation_id.to_string()));
        };
        // 最后追加的未决请求即为挂起所等待的请求
        let Some(pending) = unresolved_requests(own.iter().copied()).pop() else {
            return Err(AgentError::NotSuspended(invocation_id.to_string()));
        };
        tracing::info!(
            invocation_id,
            approval_id = %pending.approval_id,
            "suspended invocation restored from session log"
        );
        let inv = Invocation::restore(invocation_id, session, pending, first.timestamp);
        self.invocations
            .write()
            .await
            .entry(inv.id.clone())
            .or_insert(inv);
        Ok(())
    }

    /// 注册表中运行中或挂起的 Invocation 数
    pub async fn active_count(&self) -> usize {
        self.invocations.read().await.len()
    }

    /// 校验并解决审批：Invocation 必须处于 Suspended，approval id 必须是最近的未决请求
    pub async fn resume(
        &self,
        response: &ConfirmationResponse,
    ) -> Result<ConfirmationRequest, AgentError> {
        let mut invocations = self.invocations.write().await;
        let Some(inv) = invocations.get_mut(&response.invocation_id) else {
            return Err(if self.finished_status(&response.invocation_id).await.is_some() {
                AgentError::NotSuspended(response.invocation_id.clone())
            } else {
                AgentError::InvocationNotFound(response.invocation_id.clone())
            });
        };
        if inv.status != InvocationStatus::Suspended {
            return Err(AgentError::NotSuspended(inv.id.clone()));
        }
        let expected = inv.pending.as_ref().map(|r| r.approval_id.clone());
        if expected.as_deref() != Some(response.approval_id.as_str()) {
            tracing::warn!(
                invocation_id = %inv.id,
                got = %response.approval_id,
                "stale or unknown approval id rejected"
            );
            return Err(AgentError::ConfirmationMismatch {
                expected,
                got: response.approval_id.clone(),
            });
        }
        inv.resume()
    }

    pub async fn status(&self, invocation_id: &str) -> Option<InvocationStatus> {
        let active = self
            .invocations
            .read()
            .await
            .get(invocation_id)
            .map(|inv| inv.status);
        match active {
            Some(status) => Some(status),
            None => self.finished_status(invocation_id).await,
        }
    }

    async fn finished_status(&self, invocation_id: &str) -> Option<InvocationStatus> {
        self.finished
            .read()
            .await
            .iter()
            .rev()
            .find(|(id, _)| id == invocation_id)
            .map(|(_, status)| *status)
    }

    pub async fn pending(&self, invocation_id: &str) -> Option<ConfirmationRequest> {
        self.invocations
            .read()
            .await
            .get(invocation_id)
            .and_then(|inv| inv.pending.clone())
    }

    pub async fn session_of(&self, invocation_id: &str) -> Option<SessionKey> {
        self.invocations
            .read()
            .await
            .get(invocation_id)
            .map(|inv| inv.session.clone())
    }

    /// 按 approval id 查找当前正在等待该请求的 Invocation
    pub async fn find_by_approval(&self, approval_id: &str) -> Option<InvocationId> {
        self.invocations
            .read()
            .await
            .values()
            .find(|inv| {
                inv.pending
                    .as_ref()
                    .map(|r| r.approval_id == approval_id)
                    .unwrap_or(false)
            })
            .map(|inv| inv.id.clone())
    }

    async fn with_invocation(
        &self,
        invocation_id: &str,
        f: impl FnOnce(&mut Invocation) -> Result<(), AgentError>,
    ) -> Result<(), AgentError> {
        let mut invocations = self.invocations.write().await;
        let inv = invocations
            .get_mut(invocation_id)
            .ok_or_else(|| AgentError::InvocationNotFound(invocation_id.to_string()))?;
        f(inv)
    }
}

/// 每个分支只看最后一次请求；该请求没有对应响应时视为未决
pub fn unresolved_requests<'a>(events: impl IntoIterator<Item = &'a Event>) -> Vec<ConfirmationRequest> {
    let mut latest: Vec<ConfirmationRequest> = Vec::new();
    let mut answered: Vec<String> = Vec::new();
    for event in events {
        if let Some(request) = &event.actions.confirmation_request {
            latest.retain(|r| r.branch != request.branch);
            latest.push(request.clone());
        }
        if let Some(response) = &event.actions.confirmation_response {
            answered.push(response.approval_id.clone());
        }
    }
    latest
        .into_iter()
        .filter(|r| !answered.contains(&r.approval_id))
        .collect()
}

/// 在会话日志中查找仍在等待该 approval id 的 Invocation
pub fn pending_invocation(events: &[Event], approval_id: &str) -> Option<InvocationId> {
    let invocation_id = events
        .iter()
        .filter_map(|e| e.actions.confirmation_request.as_ref())
        .find(|r| r.approval_id == approval_id)
        .map(|r| r.invocation_id.clone())?;
    let own = events.iter().filter(|e| e.invocation_id == invocation_id);
    unresolved_requests(own)
        .last()
        .filter(|r| r.approval_id == approval_id)
        .map(|_| invocation_id)
}

/// 从入站消息中提取审批响应片段，返回 (approval_id, confirmed)
pub fn response_from_message(message: &Message) -> Option<(String, bool)> {
    message.parts.iter().find_map(|part| match part {
        Part::ToolResult(result) if result.name == REQUEST_CONFIRMATION => Some((
            result.id.clone(),
            result
                .response
                .get("confirmed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        )),
        _ => None,
    })
}

/// 构造审批响应消息（调用方使用）
pub fn confirmation_message(approval_id: &str, confirmed: bool) -> Message {
    Message::tool_result(ToolResult {
        id: approval_id.to_string(),
        name: REQUEST_CONFIRMATION.to_string(),
        response: json!({ "confirmed": confirmed }),
    })
}
