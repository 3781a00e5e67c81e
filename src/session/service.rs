//! 会话服务：会话的创建、读取与事件追加
//!
//! 核心只通过 append_event 修改会话；增量与事件一起原子生效。
//! user: 与 app: 分区在同一用户 / 同一应用的会话之间共享，读取时叠加到会话视图上。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::session::{Event, Scope, State};

/// 会话标识 (app_name, user_id, session_id)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.session_id)
    }
}

/// 会话：有序事件日志 + 当前状态快照
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub events: Vec<Event>,
    pub state: State,
    pub last_update_time: i64,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            events: Vec::new(),
            state: State::new(),
            last_update_time: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 追加事件：时间戳夹紧为单调不减，增量合并进状态
    pub fn push(&mut self, mut event: Event) -> Event {
        if let Some(last) = self.events.last() {
            if event.timestamp < last.timestamp {
                event.timestamp = last.timestamp;
            }
        }
        self.state.apply(&event.actions.state_delta);
        self.last_update_time = event.timestamp;
        self.events.push(event.clone());
        event
    }
}

/// 会话存储抽象
#[async_trait]
pub trait SessionService: Send + Sync {
    /// 创建会话；session_id 为 None 时生成；已存在则报错
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Session, AgentError>;

    async fn get_session(&self, key: &SessionKey) -> Result<Option<Session>, AgentError>;

    /// 追加事件并原子合并其状态增量，返回实际存储的事件
    async fn append_event(&self, key: &SessionKey, event: Event) -> Result<Event, AgentError>;

    /// 当前状态（含共享的 user: / app: 分区）
    async fn read_state(&self, key: &SessionKey) -> Result<State, AgentError> {
        self.get_session(key)
            .await?
            .map(|s| s.state)
            .ok_or_else(|| AgentError::Session(format!("session not found: {key}")))
    }
}

pub(crate) fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Default)]
struct Store {
    sessions: HashMap<SessionKey, Session>,
    user_state: HashMap<(String, String), State>,
    app_state: HashMap<String, State>,
}

impl Store {
    fn view(&self, session: &Session, key: &SessionKey) -> Session {
        let mut out = session.clone();
        if let Some(user) = self
            .user_state
            .get(&(key.app_name.clone(), key.user_id.clone()))
        {
            out.state.replace_scope(Scope::User, user);
        }
        if let Some(app) = self.app_state.get(&key.app_name) {
            out.state.replace_scope(Scope::App, app);
        }
        out
    }
}

/// 内存会话服务（测试与单进程场景）
#[derive(Clone, Default)]
pub struct InMemorySessionService {
    store: Arc<RwLock<Store>>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Session, AgentError> {
        let id = session_id.map(str::to_string).unwrap_or_else(new_session_id);
        let key = SessionKey::new(app_name, user_id, id);
        let mut store = self.store.write().await;
        if store.sessions.contains_key(&key) {
            return Err(AgentError::Session(format!("session already exists: {key}")));
        }
        let session = Session::new(key.clone());
        store.sessions.insert(key.clone(), session.clone());
        tracing::debug!(session = %key, "session created");
        Ok(store.view(&session, &key))
    }

    async fn get_session(&self, key: &SessionKey) -> Result<Option<Session>, AgentError> {
        let store = self.store.read().await;
        Ok(store.sessions.get(key).map(|s| store.view(s, key)))
    }

    async fn append_event(&self, key: &SessionKey, event: Event) -> Result<Event, AgentError> {
        let mut store = self.store.write().await;
        let stored = store
            .sessions
            .get_mut(key)
            .ok_or_else(|| AgentError::Session(format!("session not found: {key}")))?
            .push(event);

        let delta = &stored.actions.state_delta;
        if delta.iter().any(|(k, _)| Scope::parse(k).0 == Scope::User) {
            store
                .user_state
                .entry((key.app_name.clone(), key.user_id.clone()))
                .or_default()
                .apply(delta);
        }
        if delta.iter().any(|(k, _)| Scope::parse(k).0 == Scope::App) {
            store
                .app_state
                .entry(key.app_name.clone())
                .or_default()
                .apply(delta);
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Message, StateDelta};
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_duplicate() {
        let svc = InMemorySessionService::new();
        let session = svc.create_session("app", "u1", Some("s1")).await.unwrap();
        assert!(session.events.is_empty());
        assert!(svc.create_session("app", "u1", Some("s1")).await.is_err());
        let generated = svc.create_session("app", "u1", None).await.unwrap();
        assert!(!generated.key.session_id.is_empty());
    }

    #[tokio::test]
    async fn test_append_applies_delta_and_orders_timestamps() {
        let svc = InMemorySessionService::new();
        let key = SessionKey::new("app", "u1", "s1");
        svc.create_session("app", "u1", Some("s1")).await.unwrap();

        let mut delta = StateDelta::new();
        delta.set("topic", "robots");
        let mut first = Event::new("user").with_content(Message::user("hi")).with_delta(delta);
        first.timestamp = 2_000;
        let mut second = Event::new("writer");
        second.timestamp = 1_000;

        svc.append_event(&key, first).await.unwrap();
        let stored = svc.append_event(&key, second).await.unwrap();
        assert_eq!(stored.timestamp, 2_000);

        let state = svc.read_state(&key).await.unwrap();
        assert_eq!(state.get("topic"), Some(&json!("robots")));
    }

    #[tokio::test]
    async fn test_user_and_app_state_shared_across_sessions() {
        let svc = InMemorySessionService::new();
        let s1 = SessionKey::new("app", "u1", "s1");
        let s2 = SessionKey::new("app", "u1", "s2");
        let other = SessionKey::new("app", "u2", "s3");
        svc.create_session("app", "u1", Some("s1")).await.unwrap();
        svc.create_session("app", "u1", Some("s2")).await.unwrap();
        svc.create_session("app", "u2", Some("s3")).await.unwrap();

        let mut delta = StateDelta::new();
        delta.set("user:name", "Sam");
        delta.set("app:version", 2);
        delta.set("draft", "only here");
        svc.append_event(&s1, Event::new("writer").with_delta(delta))
            .await
            .unwrap();

        let state2 = svc.read_state(&s2).await.unwrap();
        assert_eq!(state2.get_str("user:name"), Some("Sam"));
        assert_eq!(state2.get_as::<u32>("app:version"), Some(2));
        assert!(!state2.contains("draft"));

        let state3 = svc.read_state(&other).await.unwrap();
        assert!(!state3.contains("user:name"));
        assert!(state3.contains("app:version"));
    }

    #[tokio::test]
    async fn test_append_to_missing_session() {
        let svc = InMemorySessionService::new();
        let key = SessionKey::new("app", "u1", "missing");
        assert!(matches!(
            svc.append_event(&key, Event::new("user")).await,
            Err(AgentError::Session(_))
        ));
    }
}
