//! 会话持久化
//!
//! 每个会话一个 JSON 文件，跨进程恢复会话日志与状态；user: / app: 共享分区单独存放。
//! 目录结构：`<root>/<app>/<user>/<session>.json`、`<root>/<app>/<user>/_user_state.json`、`<root>/<app>/_app_state.json`。

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::core::AgentError;
use crate::session::service::new_session_id;
use crate::session::{Event, Scope, Session, SessionKey, SessionService, State};

const USER_STATE_FILE: &str = "_user_state.json";
const APP_STATE_FILE: &str = "_app_state.json";

/// 文件会话服务：写操作串行化，读取时叠加共享分区
#[derive(Debug)]
pub struct JsonFileSessionService {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSessionService {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn user_dir(&self, key: &SessionKey) -> anyhow::Result<PathBuf> {
        Ok(self
            .root
            .join(path_component(&key.app_name)?)
            .join(path_component(&key.user_id)?))
    }

    fn session_path(&self, key: &SessionKey) -> anyhow::Result<PathBuf> {
        Ok(self
            .user_dir(key)?
            .join(format!("{}.json", path_component(&key.session_id)?)))
    }

    fn user_state_path(&self, key: &SessionKey) -> anyhow::Result<PathBuf> {
        Ok(self.user_dir(key)?.join(USER_STATE_FILE))
    }

    fn app_state_path(&self, key: &SessionKey) -> anyhow::Result<PathBuf> {
        Ok(self.root.join(path_component(&key.app_name)?).join(APP_STATE_FILE))
    }

    async fn view(&self, mut session: Session) -> anyhow::Result<Session> {
        let user: State = load_json(&self.user_state_path(&session.key)?)
            .await?
            .unwrap_or_default();
        let app: State = load_json(&self.app_state_path(&session.key)?)
            .await?
            .unwrap_or_default();
        session.state.replace_scope(Scope::User, &user);
        session.state.replace_scope(Scope::App, &app);
        Ok(session)
    }

    async fn append_inner(&self, key: &SessionKey, event: Event) -> anyhow::Result<Event> {
        let _guard = self.write_lock.lock().await;
        let path = self.session_path(key)?;
        let mut session: Session = load_json(&path)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found: {key}"))?;
        let stored = session.push(event);
        save_json(&path, &session).await?;

        let delta = &stored.actions.state_delta;
        for (scope, path) in [
            (Scope::User, self.user_state_path(key)?),
            (Scope::App, self.app_state_path(key)?),
        ] {
            if delta.iter().any(|(k, _)| Scope::parse(k).0 == scope) {
                let mut shared: State = load_json(&path).await?.unwrap_or_default();
                shared.apply(delta);
                save_json(&path, &shared.only(&[scope])).await?;
            }
        }
        Ok(stored)
    }
}

/// 校验用作路径的一段 id：不能为空、不能含路径分隔符、不能以 `_` 开头（保留给共享状态文件）
fn path_component(value: &str) -> anyhow::Result<&str> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.starts_with('_')
        && !value.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control());
    if !valid {
        anyhow::bail!("invalid id for file store: {value:?}");
    }
    Ok(value)
}

/// 读取 JSON 文件；不存在时返回 None
async fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    let value = serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

/// 写入 JSON 文件：先写临时文件再 rename，避免中途失败留下截断的文件；父目录不存在时自动创建
async fn save_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_string_pretty(value)?)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

fn session_err(e: anyhow::Error) -> AgentError {
    AgentError::Session(format!("{e:#}"))
}

#[async_trait]
impl SessionService for JsonFileSessionService {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Session, AgentError> {
        let id = session_id.map(str::to_string).unwrap_or_else(new_session_id);
        let key = SessionKey::new(app_name, user_id, id);
        let _guard = self.write_lock.lock().await;
        let path = self.session_path(&key).map_err(session_err)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AgentError::Session(format!("session already exists: {key}")));
        }
        let session = Session::new(key);
        save_json(&path, &session).await.map_err(session_err)?;
        self.view(session).await.map_err(session_err)
    }

    async fn get_session(&self, key: &SessionKey) -> Result<Option<Session>, AgentError> {
        let path = self.session_path(key).map_err(session_err)?;
        let session: Option<Session> = load_json(&path).await.map_err(session_err)?;
        match session {
            Some(s) => Ok(Some(self.view(s).await.map_err(session_err)?)),
            None => Ok(None),
        }
    }

    async fn append_event(&self, key: &SessionKey, event: Event) -> Result<Event, AgentError> {
        self.append_inner(key, event).await.map_err(session_err)
    }
}
