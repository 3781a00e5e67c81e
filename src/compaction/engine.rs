//! 压缩引擎：作为追加后钩子观察日志增长
//!
//! 自上次压缩以来新增的原始事件数达到 compaction_interval 时，窗口为 [上次保留起点, 最新事件+1)；
//! 窗口末尾 overlap_size 条原始事件原样保留，其余连同上次摘要交给 Summarizer，生成一条派生的压缩事件。
//! 原事件不删除、不改写。

use std::sync::Arc;

use async_trait::async_trait;

use crate::compaction::{latest_record, Summarizer};
use crate::config::CompactionSection;
use crate::core::AgentError;
use crate::runner::{HookContext, RunnerHook};
use crate::session::{CompactionRecord, Event};

pub const COMPACTION_AUTHOR: &str = "compaction";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionConfig {
    pub compaction_interval: usize,
    pub overlap_size: usize,
}

impl From<&CompactionSection> for CompactionConfig {
    fn from(section: &CompactionSection) -> Self {
        Self {
            compaction_interval: section.compaction_interval,
            overlap_size: section.overlap_size,
        }
    }
}

pub struct CompactionEngine {
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl CompactionEngine {
    pub fn new(config: CompactionConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { config, summarizer }
    }

    pub fn config(&self) -> CompactionConfig {
        self.config
    }

    /// 检查完整日志，需要压缩时返回派生的压缩事件（尚未追加）
    pub async fn compact(&self, events: &[Event]) -> Result<Option<Event>, AgentError> {
        if self.config.compaction_interval == 0 {
            return Ok(None);
        }
        let previous = latest_record(events)?;
        let (start, counted_from, previous_summary) = match previous {
            Some((_, record)) => (record.retained_from, record.end, Some(record.summary.as_str())),
            None => (0, 0, None),
        };

        let new_raw = events
            .iter()
            .skip(counted_from)
            .filter(|e| e.is_raw())
            .count();
        if new_raw < self.config.compaction_interval {
            return Ok(None);
        }

        let end = events.len();
        let raw_positions: Vec<usize> = (start..end).filter(|&i| events[i].is_raw()).collect();
        let keep = self.config.overlap_size.min(raw_positions.len());
        let retained_from = raw_positions
            .get(raw_positions.len() - keep)
            .copied()
            .unwrap_or(end);

        let to_summarize: Vec<Event> = raw_positions
            .iter()
            .filter(|&&i| i < retained_from)
            .map(|&i| events[i].clone())
            .collect();
        let summary = self
            .summarizer
            .summarize(previous_summary, &to_summarize)
            .await?;

        tracing::info!(
            start,
            end,
            retained_from,
            summarized = to_summarize.len(),
            "history compacted"
        );
        Ok(Some(Event::new(COMPACTION_AUTHOR).with_compaction(
            CompactionRecord {
                start,
                end,
                overlap_size: end - retained_from,
                retained_from,
                summary,
            },
        )))
    }
}

#[async_trait]
impl RunnerHook for CompactionEngine {
    fn name(&self) -> &str {
        "compaction"
    }

    async fn after_event(&self, ctx: &HookContext, event: &Event) -> Result<Vec<Event>, AgentError> {
        if event.is_compaction() {
            return Ok(Vec::new());
        }
        let Some(session) = ctx.session_service.get_session(&ctx.session).await? else {
            return Ok(Vec::new());
        };
        Ok(self
            .compact(&session.events)
            .await?
            .map(|e| e.with_invocation(ctx.invocation_id.clone()))
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::{context_view, DigestSummarizer};
    use crate::session::Message;

    fn engine(interval: usize, overlap: usize) -> CompactionEngine {
        CompactionEngine::new(
            CompactionConfig {
                compaction_interval: interval,
                overlap_size: overlap,
            },
            Arc::new(DigestSummarizer::default()),
        )
    }

    fn raw(text: &str) -> Event {
        Event::new("user").with_content(Message::user(text))
    }

    #[tokio::test]
    async fn test_triggers_on_third_raw_event_with_overlap_one() {
        let engine = engine(3, 1);
        let mut events = vec![raw("one"), raw("two")];
        assert!(engine.compact(&events).await.unwrap().is_none());

        events.push(raw("three"));
        let compaction = engine.compact(&events).await.unwrap().unwrap();
        let record = compaction.actions.compaction.clone().unwrap();
        assert_eq!((record.start, record.end), (0, 3));
        assert_eq!(record.retained_from, 2);
        assert_eq!(record.overlap_size, 1);
        assert!(record.summary.contains("one"));
        assert!(!record.summary.contains("three"));

        events.push(compaction);
        // 压缩事件本身不计入新增
        assert!(engine.compact(&events).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_window_is_cumulative() {
        let engine = engine(3, 1);
        let mut events = vec![raw("one"), raw("two"), raw("three")];
        let first = engine.compact(&events).await.unwrap().unwrap();
        events.push(first);
        events.extend([raw("four"), raw("five")]);
        assert!(engine.compact(&events).await.unwrap().is_none());
        events.push(raw("six"));

        let second = engine.compact(&events).await.unwrap().unwrap();
        let record = second.actions.compaction.clone().unwrap();
        assert_eq!(record.start, 2);
        assert_eq!(record.end, 7);
        assert_eq!(record.retained_from, 6);
        assert!(record.summary.contains("one"));
        assert!(record.summary.contains("five"));
        events.push(second);

        let view = context_view(&events).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view[1].text(), "six");
    }

    #[tokio::test]
    async fn test_zero_interval_disables() {
        let engine = engine(0, 1);
        let events = vec![raw("a"), raw("b"), raw("c")];
        assert!(engine.compact(&events).await.unwrap().is_none());
    }
}
