//! 测试用生成器（无需模型）
//!
//! ScriptedProducer 按顺序返回预设回复；FnProducer 用闭包根据请求计算回复。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ModelError, TurnProducer, TurnRequest};
use crate::session::Message;

/// 按脚本依次回复；脚本耗尽后返回 fallback 文本
#[derive(Debug)]
pub struct ScriptedProducer {
    replies: Mutex<VecDeque<Result<Message, ModelError>>>,
    fallback: String,
    calls: Mutex<Vec<TurnRequest>>,
}

impl ScriptedProducer {
    pub fn new(replies: impl IntoIterator<Item = Message>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            fallback: "(done)".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 单条文本回复
    pub fn text(text: impl Into<String>) -> Self {
        Self::new([Message::model(text)])
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// 在脚本末尾追加一个错误
    pub fn then_error(self, error: ModelError) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(error));
        }
        self
    }

    /// 已收到的请求（断言用）
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TurnProducer for ScriptedProducer {
    async fn produce(&self, request: &TurnRequest) -> Result<Message, ModelError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        next.unwrap_or_else(|| Ok(Message::model(self.fallback.clone())))
    }
}

type ProduceFn = dyn Fn(&TurnRequest) -> Result<Message, ModelError> + Send + Sync;

/// 闭包生成器
pub struct FnProducer {
    f: Box<ProduceFn>,
}

impl FnProducer {
    pub fn new(f: impl Fn(&TurnRequest) -> Result<Message, ModelError> + Send + Sync + 'static) -> Self {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl TurnProducer for FnProducer {
    async fn produce(&self, request: &TurnRequest) -> Result<Message, ModelError> {
        (self.f)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::State;

    fn request() -> TurnRequest {
        TurnRequest {
            unit: "writer".into(),
            instruction: "write".into(),
            contents: vec![Message::user("a robot story")],
            tools: vec![],
            state: State::new(),
            memory: vec![],
        }
    }

    #[tokio::test]
    async fn test_scripted_in_order_then_fallback() {
        let producer = ScriptedProducer::new([Message::model("one"), Message::model("two")])
            .with_fallback("idle");
        let req = request();
        assert_eq!(producer.produce(&req).await.unwrap().text(), "one");
        assert_eq!(producer.produce(&req).await.unwrap().text(), "two");
        assert_eq!(producer.produce(&req).await.unwrap().text(), "idle");
        assert_eq!(producer.call_count(), 3);
    }

    #[tokio::test]
    async fn test_fn_producer_reads_request() {
        let producer = FnProducer::new(|req| {
            Ok(Message::model(format!(
                "echo: {}",
                req.last_user_text().unwrap_or_default()
            )))
        });
        let reply = producer.produce(&request()).await.unwrap();
        assert_eq!(reply.text(), "echo: a robot story");
    }
}
