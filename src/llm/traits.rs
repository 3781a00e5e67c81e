//! 回合生成器抽象
//!
//! LeafUnit 不关心模型如何推理：它把指令、压缩后的历史、工具声明交给 TurnProducer，拿回一条回复消息。
//! 回复可以是纯文本（本回合结束），也可以包含若干 ToolCall。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::MemorySnippet;
use crate::session::{Message, State};

/// 传输层状态码中视为瞬时错误、可重试的集合
pub const TRANSIENT_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// 生成器错误：带可选状态码，按状态码区分瞬时 / 致命
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{}{message}", status_prefix(.status))]
pub struct ModelError {
    pub status: Option<u16>,
    pub message: String,
}

fn status_prefix(status: &Option<u16>) -> String {
    status.map(|code| format!("[{code}] ")).unwrap_or_default()
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.status
            .map(|code| TRANSIENT_STATUS.contains(&code))
            .unwrap_or(false)
    }
}

/// 提供给生成器的工具声明（名称、描述、参数 schema）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 单次生成请求
#[derive(Clone, Debug)]
pub struct TurnRequest {
    /// 发起请求的单元名
    pub unit: String,
    /// 已渲染的指令
    pub instruction: String,
    /// 压缩视图下的对话历史
    pub contents: Vec<Message>,
    pub tools: Vec<ToolDeclaration>,
    /// 当前可见状态快照
    pub state: State,
    /// 预加载的长期记忆
    pub memory: Vec<MemorySnippet>,
}

impl TurnRequest {
    /// 最近一条用户文本（生成器常用的输入）
    pub fn last_user_text(&self) -> Option<String> {
        self.contents
            .iter()
            .rev()
            .find(|m| m.role == crate::session::Role::User && m.has_text())
            .map(Message::text)
    }
}

/// 回合生成器
#[async_trait]
pub trait TurnProducer: Send + Sync {
    async fn produce(&self, request: &TurnRequest) -> Result<Message, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ModelError::with_status(429, "rate limited").is_transient());
        assert!(ModelError::with_status(503, "unavailable").is_transient());
        assert!(!ModelError::with_status(400, "bad request").is_transient());
        assert!(!ModelError::new("no status").is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ModelError::with_status(500, "boom").to_string(),
            "[500] boom"
        );
        assert_eq!(ModelError::new("plain").to_string(), "plain");
    }
}
