//! 编排错误类型与事件上的错误信息
//!
//! 与组合器策略配合：工具类错误可恢复（写入 Error 事件后继续），组合 / 审批 / 压缩类错误为致命错误。
//! 所有错误最终以 ErrorInfo 的形式附在 Event 上追加到日志，不会被静默丢弃。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::ModelError;

/// 编排过程中可能出现的错误（工具、模型、组合、审批、压缩、会话存储等）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Tool execution failed: {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for tool {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// 子单元所需的输入 key 在 State 中不存在（致命，终止剩余序列）
    #[error("Missing state key '{key}' required by unit {unit}")]
    MissingStateKey { unit: String, key: String },

    #[error("Parallel sub-units failed: {}", failed.join(", "))]
    ParallelFailed { failed: Vec<String> },

    /// 用过期或未知的 approval id 恢复；调用被拒绝，Invocation 保持 Suspended
    #[error("Confirmation mismatch: expected approval {expected:?}, got {got}")]
    ConfirmationMismatch { expected: Option<String>, got: String },

    #[error("Invocation {0} is not suspended")]
    NotSuspended(String),

    #[error("Invocation not found: {0}")]
    InvocationNotFound(String),

    #[error("Invalid invocation transition: {0}")]
    InvalidTransition(String),

    /// 压缩记录引用了不存在的事件区间；不变量被破坏，不做自动修复
    #[error("Compaction inconsistency: {0}")]
    CompactionInconsistency(String),

    #[error("Step limit exceeded in unit {0}")]
    StepLimitExceeded(String),

    #[error("Remote agent error: {0}")]
    Remote(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("Sub-unit task aborted: {0}")]
    TaskAborted(String),
}

/// 错误分类（序列化到事件中）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Tool,
    Model,
    Composition,
    ConfirmationMismatch,
    CompactionInconsistency,
    Remote,
    Session,
    Cancelled,
    Internal,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Tool { .. }
            | AgentError::ToolTimeout(_)
            | AgentError::UnknownTool(_)
            | AgentError::InvalidArguments { .. } => ErrorKind::Tool,
            AgentError::Model(_) => ErrorKind::Model,
            AgentError::MissingStateKey { .. }
            | AgentError::ParallelFailed { .. }
            | AgentError::StepLimitExceeded(_) => ErrorKind::Composition,
            AgentError::ConfirmationMismatch { .. } | AgentError::NotSuspended(_) => {
                ErrorKind::ConfirmationMismatch
            }
            AgentError::CompactionInconsistency(_) => ErrorKind::CompactionInconsistency,
            AgentError::Remote(_) => ErrorKind::Remote,
            AgentError::Session(_) => ErrorKind::Session,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::InvocationNotFound(_)
            | AgentError::InvalidTransition(_)
            | AgentError::Config(_)
            | AgentError::TaskAborted(_) => ErrorKind::Internal,
        }
    }

    /// 工具类错误默认可恢复：以 Error 事件呈现，由组合器决定是否继续
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Tool)
    }
}

/// 附在 Event 上的错误信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// 为 true 表示该事件记录的是一个单元的失败（而非单元内部已处理的工具错误）
    #[serde(default)]
    pub unit_failed: bool,
    #[serde(default)]
    pub recoverable: bool,
}

impl ErrorInfo {
    pub fn from_error(err: &AgentError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            unit_failed: false,
            recoverable: err.is_recoverable(),
        }
    }

    pub fn unit_failure(err: &AgentError, recoverable: bool) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            unit_failed: true,
            recoverable,
        }
    }
}
