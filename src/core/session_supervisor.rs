//! Invocation 监管：取消令牌
//!
//! 每个运行中的 Invocation 持有一个 CancellationToken；取消只表示「不再继续」，
//! 已追加到日志的状态增量不会回滚。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 按 invocation id 管理取消令牌
#[derive(Debug, Clone, Default)]
pub struct SessionSupervisor {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为 Invocation 注册（或复用）取消令牌
    pub async fn register(&self, invocation_id: &str) -> CancellationToken {
        let mut tokens = self.tokens.write().await;
        tokens
            .entry(invocation_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// 触发取消；返回该 Invocation 是否正在运行
    pub async fn cancel(&self, invocation_id: &str) -> bool {
        match self.tokens.read().await.get(invocation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Invocation 本轮执行结束（完成、失败或挂起）后释放令牌
    pub async fn release(&self, invocation_id: &str) {
        self.tokens.write().await.remove(invocation_id);
    }

    pub async fn active_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_registered_invocation() {
        let supervisor = SessionSupervisor::new();
        let token = supervisor.register("inv_1").await;
        assert!(!token.is_cancelled());
        assert!(supervisor.cancel("inv_1").await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_unknown_invocation() {
        let supervisor = SessionSupervisor::new();
        assert!(!supervisor.cancel("missing").await);
    }

    #[tokio::test]
    async fn test_release_removes_token() {
        let supervisor = SessionSupervisor::new();
        supervisor.register("inv_1").await;
        assert_eq!(supervisor.active_count().await, 1);
        supervisor.release("inv_1").await;
        assert_eq!(supervisor.active_count().await, 0);
    }
}
