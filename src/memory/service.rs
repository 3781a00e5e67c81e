//! 长期记忆：按 (app, user) 归档会话内容，跨会话检索
//!
//! add_session_to_memory 把会话中有文本的事件存为片段（按事件 id 去重）；
//! search_memory 按关键词重叠打分排序返回。后续可替换为真实向量库。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::session::Session;

/// 检索结果片段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemorySnippet {
    pub event_id: String,
    pub session_id: String,
    pub author: String,
    pub text: String,
    pub timestamp: i64,
}

/// 记忆服务 trait
#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn add_session_to_memory(&self, session: &Session) -> Result<(), AgentError>;

    /// 按相关度降序返回
    async fn search_memory(
        &self,
        app_name: &str,
        user_id: &str,
        query: &str,
    ) -> Result<Vec<MemorySnippet>, AgentError>;
}

/// 将文本切分为小写词集合（去掉首尾标点），用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.chars().count() > 1)
        .collect()
}

struct Entry {
    snippet: MemorySnippet,
    tokens: HashSet<String>,
}

/// 简单内存实现：按关键词重叠检索
#[derive(Clone)]
pub struct InMemoryMemoryService {
    store: Arc<RwLock<HashMap<(String, String), Vec<Entry>>>>,
    max_entries: usize,
    search_limit: usize,
}

impl InMemoryMemoryService {
    pub fn new(max_entries: usize, search_limit: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            max_entries,
            search_limit,
        }
    }

    pub async fn len(&self, app_name: &str, user_id: &str) -> usize {
        self.store
            .read()
            .await
            .get(&(app_name.to_string(), user_id.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for InMemoryMemoryService {
    fn default() -> Self {
        Self::new(1000, 5)
    }
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    async fn add_session_to_memory(&self, session: &Session) -> Result<(), AgentError> {
        let key = (session.key.app_name.clone(), session.key.user_id.clone());
        let mut store = self.store.write().await;
        let entries = store.entry(key).or_default();
        let known: HashSet<String> = entries.iter().map(|e| e.snippet.event_id.clone()).collect();

        let mut added = 0usize;
        for event in session.events.iter().filter(|e| e.is_raw()) {
            let text = event.text();
            let text = text.trim();
            if text.is_empty() || known.contains(&event.id) {
                continue;
            }
            entries.push(Entry {
                snippet: MemorySnippet {
                    event_id: event.id.clone(),
                    session_id: session.key.session_id.clone(),
                    author: event.author.clone(),
                    text: text.to_string(),
                    timestamp: event.timestamp,
                },
                tokens: tokenize_lower(text),
            });
            added += 1;
        }
        let n = entries.len();
        if n > self.max_entries {
            entries.drain(0..n - self.max_entries);
        }
        tracing::debug!(session = %session.key, added, "session added to memory");
        Ok(())
    }

    async fn search_memory(
        &self,
        app_name: &str,
        user_id: &str,
        query: &str,
    ) -> Result<Vec<MemorySnippet>, AgentError> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.read().await;
        let Some(entries) = store.get(&(app_name.to_string(), user_id.to_string())) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(usize, &MemorySnippet)> = entries
            .iter()
            .map(|e| (query_tokens.intersection(&e.tokens).count(), &e.snippet))
            .filter(|(s, _)| *s > 0)
            .collect();
        // 同分时较新的在前
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.timestamp.cmp(&a.1.timestamp)));
        Ok(scored
            .into_iter()
            .take(self.search_limit)
            .map(|(_, s)| s.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Event, Message, SessionKey};

    fn session(id: &str, texts: &[&str]) -> Session {
        let mut session = Session::new(SessionKey::new("app", "u1", id));
        for (i, text) in texts.iter().enumerate() {
            let mut event = Event::new(if i % 2 == 0 { "user" } else { "assistant" })
                .with_content(Message::user(*text));
            event.timestamp = i as i64;
            session.push(event);
        }
        session
    }

    #[tokio::test]
    async fn test_search_ranks_by_overlap() {
        let memory = InMemoryMemoryService::default();
        memory
            .add_session_to_memory(&session(
                "s1",
                &["My favorite color is blue.", "Noted: favorite color blue", "I live in Berlin"],
            ))
            .await
            .unwrap();

        let hits = memory
            .search_memory("app", "u1", "what is my favorite color?")
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].text.contains("favorite"));
        assert!(memory
            .search_memory("app", "other", "favorite color")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_adding_same_session_twice_dedups() {
        let memory = InMemoryMemoryService::default();
        let s = session("s1", &["hello world", "hi there"]);
        memory.add_session_to_memory(&s).await.unwrap();
        memory.add_session_to_memory(&s).await.unwrap();
        assert_eq!(memory.len("app", "u1").await, 2);
    }

    #[tokio::test]
    async fn test_max_entries_keeps_newest() {
        let memory = InMemoryMemoryService::new(2, 5);
        memory
            .add_session_to_memory(&session("s1", &["alpha one", "beta two", "gamma three"]))
            .await
            .unwrap();
        assert_eq!(memory.len("app", "u1").await, 2);
        assert!(memory.search_memory("app", "u1", "alpha").await.unwrap().is_empty());
    }
}
