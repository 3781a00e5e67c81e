//! 事件：Event Log 的基本记录
//!
//! 事件追加后不可变；状态变更、审批请求/响应、压缩摘要与循环终止信号都以 EventActions 的形式挂在事件上。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ErrorInfo;
use crate::session::{Message, StateDelta, ToolCall};

/// 用户输入事件的 author
pub const USER_AUTHOR: &str = "user";

/// 审批请求：挂起 Invocation 直到外部给出决定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub approval_id: String,
    pub invocation_id: String,
    pub hint: String,
    #[serde(default)]
    pub payload: Value,
    /// 被拦截的工具调用；远程委派产生的请求没有对应调用
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    /// 发起请求的单元路径
    pub branch: String,
}

/// 审批响应
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    pub approval_id: String,
    pub invocation_id: String,
    pub confirmed: bool,
}

/// 压缩记录：覆盖日志位置 [start, end)，原事件保留在日志中
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub start: usize,
    pub end: usize,
    pub overlap_size: usize,
    /// 原样保留的第一条原始事件位置（之前的部分由 summary 代替）
    pub retained_from: usize,
    pub summary: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActions {
    #[serde(default, skip_serializing_if = "StateDelta::is_empty")]
    pub state_delta: StateDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_request: Option<ConfirmationRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_response: Option<ConfirmationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionRecord>,
    /// 循环终止信号
    #[serde(default)]
    pub terminate: bool,
}

/// 日志中的一条事件
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub invocation_id: String,
    pub author: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub content: Option<Message>,
    #[serde(default)]
    pub actions: EventActions,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    /// 毫秒时间戳；由 SessionService 在追加时保证单调不减
    pub timestamp: i64,
}

impl Event {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            invocation_id: String::new(),
            author: author.into(),
            branch: String::new(),
            content: None,
            actions: EventActions::default(),
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_invocation(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = invocation_id.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_content(mut self, content: Message) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_delta(mut self, delta: StateDelta) -> Self {
        self.actions.state_delta.merge(&delta);
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_terminate(mut self) -> Self {
        self.actions.terminate = true;
        self
    }

    pub fn with_confirmation_request(mut self, request: ConfirmationRequest) -> Self {
        self.actions.confirmation_request = Some(request);
        self
    }

    pub fn with_confirmation_response(mut self, response: ConfirmationResponse) -> Self {
        self.actions.confirmation_response = Some(response);
        self
    }

    pub fn with_compaction(mut self, record: CompactionRecord) -> Self {
        self.actions.compaction = Some(record);
        self
    }

    pub fn text(&self) -> String {
        self.content.as_ref().map(Message::text).unwrap_or_default()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content.as_ref().map(Message::calls).unwrap_or_default()
    }

    pub fn is_compaction(&self) -> bool {
        self.actions.compaction.is_some()
    }

    /// 原始事件：非压缩派生事件，参与压缩窗口计数
    pub fn is_raw(&self) -> bool {
        !self.is_compaction()
    }

    pub fn is_unit_failure(&self) -> bool {
        self.error.as_ref().map(|e| e.unit_failed).unwrap_or(false)
    }

    /// 事件分支是否位于 prefix 之下（含自身）
    pub fn is_under(&self, prefix: &str) -> bool {
        is_under(&self.branch, prefix)
    }
}

/// 分支路径前缀判断：`a.b` 与循环轮次 `a#2` 位于 `a` 之下，`ab` 不是
pub fn is_under(branch: &str, prefix: &str) -> bool {
    match branch.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('.') || rest.starts_with('#'),
        None => false,
    }
}
