//! 瞬时错误重试
//!
//! 仅对 408/429/5xx 这类瞬时错误做指数退避重试；其余错误直接返回给 LeafUnit。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm::{ModelError, TurnProducer, TurnRequest};
use crate::session::Message;

/// 重试参数：第 n 次重试等待 initial_delay_ms * exp_base^(n-1)，上限 max_delay_ms
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_exp_base")]
    pub exp_base: u32,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_exp_base() -> u32 {
    7
}
fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            exp_base: default_exp_base(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// 第 retry 次重试（从 1 开始）前的等待时间
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = (self.exp_base.max(1) as u64).saturating_pow(retry.saturating_sub(1));
        let ms = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// 包装任意生成器，瞬时错误按 RetryConfig 重试
pub struct RetryingProducer {
    inner: Arc<dyn TurnProducer>,
    config: RetryConfig,
}

impl RetryingProducer {
    pub fn new(inner: Arc<dyn TurnProducer>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl TurnProducer for RetryingProducer {
    async fn produce(&self, request: &TurnRequest) -> Result<Message, ModelError> {
        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.produce(request).await {
                Ok(message) => return Ok(message),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.config.delay_for(attempt);
                    tracing::warn!(
                        unit = %request.unit,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient model error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
