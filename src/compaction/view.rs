//! 压缩视图：生成上下文时用最近的摘要替换已压缩区间
//!
//! 审计读取原始日志；生成回合上下文的读取方使用 context_view。

use crate::core::AgentError;
use crate::session::{CompactionRecord, Event};

/// 最近一条压缩记录及其位置；记录引用的区间不合法时返回 CompactionInconsistency
pub fn latest_record(events: &[Event]) -> Result<Option<(usize, &CompactionRecord)>, AgentError> {
    let Some((idx, record)) = events
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, e)| e.actions.compaction.as_ref().map(|r| (i, r)))
    else {
        return Ok(None);
    };
    if record.start > record.retained_from
        || record.retained_from > record.end
        || record.end > idx
    {
        return Err(AgentError::CompactionInconsistency(format!(
            "record at position {idx} covers [{}, {}) retaining from {}",
            record.start, record.end, record.retained_from
        )));
    }
    Ok(Some((idx, record)))
}

/// 最近的摘要事件 + 保留的重叠事件 + 之后的原始事件
pub fn context_view(events: &[Event]) -> Result<Vec<Event>, AgentError> {
    let Some((idx, record)) = latest_record(events)? else {
        return Ok(events.to_vec());
    };
    let mut out = Vec::with_capacity(events.len() - record.retained_from + 1);
    out.push(events[idx].clone());
    out.extend(
        events
            .iter()
            .enumerate()
            .filter(|(i, e)| *i >= record.retained_from && e.is_raw())
            .map(|(_, e)| e.clone()),
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Message;

    fn raw(text: &str) -> Event {
        Event::new("user").with_content(Message::user(text))
    }

    fn compaction(start: usize, end: usize, retained_from: usize) -> Event {
        Event::new("compaction").with_compaction(CompactionRecord {
            start,
            end,
            overlap_size: end - retained_from,
            retained_from,
            summary: "earlier talk".into(),
        })
    }

    #[test]
    fn test_no_compaction_is_identity() {
        let events = vec![raw("a"), raw("b")];
        assert_eq!(context_view(&events).unwrap(), events);
    }

    #[test]
    fn test_summary_replaces_range() {
        let events = vec![raw("a"), raw("b"), raw("c"), compaction(0, 3, 2), raw("d")];
        let view = context_view(&events).unwrap();
        assert_eq!(view.len(), 3);
        assert!(view[0].is_compaction());
        assert_eq!(view[1].text(), "c");
        assert_eq!(view[2].text(), "d");
    }

    #[test]
    fn test_only_latest_summary_used() {
        let events = vec![
            raw("a"),
            raw("b"),
            raw("c"),
            compaction(0, 3, 2),
            raw("d"),
            raw("e"),
            raw("f"),
            compaction(2, 7, 6),
        ];
        let view = context_view(&events).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].id, events[7].id);
        assert_eq!(view[1].text(), "f");
    }

    #[test]
    fn test_inconsistent_record_is_fatal() {
        let events = vec![raw("a"), compaction(0, 5, 4)];
        assert!(matches!(
            context_view(&events),
            Err(AgentError::CompactionInconsistency(_))
        ));
    }
}
