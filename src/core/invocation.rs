//! Invocation 生命周期：Running / Suspended / Completed / Failed
//!
//! 一条入站消息对应一个 Invocation，可跨越多次挂起与恢复。
//! 挂起当且仅当存在未决的 ConfirmationRequest；挂起状态下不能直接完成或失败。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::session::{ConfirmationRequest, SessionKey};

pub type InvocationId = String;

/// Invocation 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvocationStatus::Completed | InvocationStatus::Failed)
    }
}

/// 单次 Invocation 的记录
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: InvocationId,
    pub session: SessionKey,
    pub status: InvocationStatus,
    /// 最近一次发出的审批请求（恢复时必须与之匹配）
    pub pending: Option<ConfirmationRequest>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl Invocation {
    pub fn new(session: SessionKey) -> Self {
        Self {
            id: format!("inv_{}", uuid::Uuid::new_v4()),
            session,
            status: InvocationStatus::Running,
            pending: None,
            started_at: chrono::Utc::now().timestamp_millis(),
            finished_at: None,
        }
    }

    /// 从事件日志重建的挂起 Invocation（进程重启后恢复用）
    pub fn restore(id: impl Into<InvocationId>, session: SessionKey, pending: ConfirmationRequest, started_at: i64) -> Self {
        Self {
            id: id.into(),
            session,
            status: InvocationStatus::Suspended,
            pending: Some(pending),
            started_at,
            finished_at: None,
        }
    }

    /// 记录一次新发出的审批请求（覆盖更早的请求）
    pub fn record_request(&mut self, request: ConfirmationRequest) {
        self.pending = Some(request);
    }

    /// Running -> Suspended；必须已有未决请求
    pub fn suspend(&mut self) -> Result<(), AgentError> {
        if self.status != InvocationStatus::Running {
            return Err(self.transition_error("suspend"));
        }
        if self.pending.is_none() {
            return Err(AgentError::InvalidTransition(format!(
                "{} cannot suspend without a pending confirmation request",
                self.id
            )));
        }
        self.status = InvocationStatus::Suspended;
        Ok(())
    }

    /// Suspended -> Running，返回被解决的请求
    pub fn resume(&mut self) -> Result<ConfirmationRequest, AgentError> {
        if self.status != InvocationStatus::Suspended {
            return Err(AgentError::NotSuspended(self.id.clone()));
        }
        let request = self
            .pending
            .take()
            .ok_or_else(|| AgentError::NotSuspended(self.id.clone()))?;
        self.status = InvocationStatus::Running;
        Ok(request)
    }

    pub fn complete(&mut self) -> Result<(), AgentError> {
        self.finish(InvocationStatus::Completed)
    }

    pub fn fail(&mut self) -> Result<(), AgentError> {
        self.finish(InvocationStatus::Failed)
    }

    fn finish(&mut self, status: InvocationStatus) -> Result<(), AgentError> {
        if self.status != InvocationStatus::Running {
            return Err(self.transition_error(if status == InvocationStatus::Completed {
                "complete"
            } else {
                "fail"
            }));
        }
        self.status = status;
        self.pending = None;
        self.finished_at = Some(chrono::Utc::now().timestamp_millis());
        Ok(())
    }

    fn transition_error(&self, action: &str) -> AgentError {
        AgentError::InvalidTransition(format!(
            "cannot {action} invocation {} in status {:?}",
            self.id, self.status
        ))
    }
}
