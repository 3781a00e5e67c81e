//! 远程单元：把回合委托给另一个 Agent 服务
//!
//! 首次运行时从 `<base_url>/.well-known/agent-card.json` 发现 AgentCard 并缓存，之后向 card.url 发送请求。
//! 远端返回 input_required 时追加待审批事件并挂起；恢复时带上 task_id 与外部决定重新调用。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;

use crate::agent::{InvocationContext, TurnUnit, UnitFailure, UnitOutcome};
use crate::core::AgentError;
use crate::session::{Event, Message, StateDelta};

pub const WELL_KNOWN_AGENT_CARD_PATH: &str = "/.well-known/agent-card.json";

/// 远程 Agent 的自描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 调用入口
    pub url: String,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// 会话 id，远端据此关联上下文
    pub context_id: String,
    pub message: Message,
    /// 恢复挂起的远程任务
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Completed,
    InputRequired,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub status: RemoteStatus,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// input_required 时给人看的提示
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait RemoteAgentClient: Send + Sync {
    async fn discover(&self, base_url: &str) -> Result<AgentCard, AgentError>;

    async fn invoke(
        &self,
        card: &AgentCard,
        request: &RemoteRequest,
    ) -> Result<RemoteResponse, AgentError>;
}

/// 基于 reqwest 的 HTTP 客户端
pub struct HttpRemoteClient {
    client: Client,
}

impl HttpRemoteClient {
    pub fn new(timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpRemoteClient {
    fn default() -> Self {
        Self::new(60)
    }
}

#[async_trait]
impl RemoteAgentClient for HttpRemoteClient {
    async fn discover(&self, base_url: &str) -> Result<AgentCard, AgentError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), WELL_KNOWN_AGENT_CARD_PATH);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::Remote(format!("discover {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(AgentError::Remote(format!("discover {url}: HTTP {}", resp.status())));
        }
        resp.json::<AgentCard>()
            .await
            .map_err(|e| AgentError::Remote(format!("invalid agent card from {url}: {e}")))
    }

    async fn invoke(
        &self,
        card: &AgentCard,
        request: &RemoteRequest,
    ) -> Result<RemoteResponse, AgentError> {
        let resp = self
            .client
            .post(&card.url)
            .json(request)
            .send()
            .await
            .map_err(|e| AgentError::Remote(format!("{}: {e}", card.name)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Remote(format!("{}: HTTP {status}: {body}", card.name)));
        }
        resp.json::<RemoteResponse>()
            .await
            .map_err(|e| AgentError::Remote(format!("invalid response from {}: {e}", card.name)))
    }
}

pub struct RemoteUnit {
    name: String,
    base_url: String,
    client: Arc<dyn RemoteAgentClient>,
    card: OnceCell<AgentCard>,
    output_key: Option<String>,
}

impl RemoteUnit {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        client: Arc<dyn RemoteAgentClient>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client,
            card: OnceCell::new(),
            output_key: None,
        }
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    async fn card(&self) -> Result<&AgentCard, AgentError> {
        self.card
            .get_or_try_init(|| self.client.discover(&self.base_url))
            .await
    }
}

#[async_trait]
impl TurnUnit for RemoteUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut InvocationContext) -> Result<UnitOutcome, UnitFailure> {
        ctx.check_cancelled(&self.name).await?;
        let (task_id, decision) = match ctx.take_resume_for_self() {
            Some(target) => (
                target
                    .request
                    .payload
                    .get("task_id")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                target.decision,
            ),
            None => (None, None),
        };

        let card = match self.card().await {
            Ok(card) => card.clone(),
            Err(e) => return Err(ctx.fail(&self.name, e, false).await),
        };
        let request = RemoteRequest {
            context_id: ctx.session.session_id.clone(),
            message: ctx
                .user_content
                .clone()
                .unwrap_or_else(|| Message::user("")),
            task_id,
            decision,
        };
        tracing::info!(
            invocation_id = %ctx.invocation_id,
            unit = %self.name,
            agent = %card.name,
            resumed = request.task_id.is_some(),
            "delegating to remote agent"
        );
        let response = match self.client.invoke(&card, &request).await {
            Ok(response) => response,
            Err(e) => return Err(ctx.fail(&self.name, e, false).await),
        };

        match response.status {
            RemoteStatus::Completed => {
                let last = response.messages.len().saturating_sub(1);
                for (i, message) in response.messages.into_iter().enumerate() {
                    let mut event = Event::new(&self.name).with_content(message);
                    if i == last {
                        if let Some(key) = &self.output_key {
                            let mut delta = StateDelta::new();
                            delta.set(key.clone(), event.text());
                            event = event.with_delta(delta);
                        }
                    }
                    ctx.emit_for(&self.name, event).await?;
                }
                Ok(UnitOutcome::Completed)
            }
            RemoteStatus::InputRequired => {
                let hint = response
                    .hint
                    .unwrap_or_else(|| format!("{} requires confirmation", card.name));
                let payload = json!({ "task_id": response.task_id, "agent": card.name });
                let event = ctx.controller().request_event(
                    &self.name,
                    &ctx.branch,
                    &ctx.invocation_id,
                    hint,
                    payload,
                    None,
                );
                ctx.emit_for(&self.name, event).await?;
                Ok(UnitOutcome::Suspended)
            }
            RemoteStatus::Failed => {
                let message = response
                    .error
                    .unwrap_or_else(|| format!("{} reported failure", card.name));
                Err(ctx.fail(&self.name, AgentError::Remote(message), false).await)
            }
        }
    }
}
