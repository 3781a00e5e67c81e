//! 摘要器：把一段原始事件（连同上一次的摘要）压成一段文本

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::llm::{TurnProducer, TurnRequest};
use crate::session::{Event, Message, State};

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// previous 为上一次压缩的摘要（累积压缩）
    async fn summarize(&self, previous: Option<&str>, events: &[Event]) -> Result<String, AgentError>;
}

/// 将事件渲染为 `author: text` 行；无文本的事件跳过
pub fn transcript(events: &[Event]) -> String {
    events
        .iter()
        .filter_map(|e| {
            let text = e.text();
            let text = text.trim();
            (!text.is_empty()).then(|| format!("{}: {}", e.author, text))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 确定性摘要：每条事件截断到 max_chars，与上一次摘要逐行拼接后只保留最近 max_lines 行（无需模型，测试与离线场景使用）
#[derive(Debug, Clone)]
pub struct DigestSummarizer {
    max_chars: usize,
    max_lines: usize,
}

/// 默认保留的摘要行数
pub const DEFAULT_DIGEST_LINES: usize = 40;

impl DigestSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            max_lines: DEFAULT_DIGEST_LINES,
        }
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines.max(1);
        self
    }
}

impl Default for DigestSummarizer {
    fn default() -> Self {
        Self::new(160)
    }
}

#[async_trait]
impl Summarizer for DigestSummarizer {
    async fn summarize(&self, previous: Option<&str>, events: &[Event]) -> Result<String, AgentError> {
        let mut lines: Vec<String> = previous
            .map(|p| p.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        for line in transcript(events).lines() {
            if line.chars().count() > self.max_chars {
                lines.push(format!("{}...", line.chars().take(self.max_chars).collect::<String>()));
            } else {
                lines.push(line.to_string());
            }
        }
        let skip = lines.len().saturating_sub(self.max_lines);
        Ok(lines[skip..].join("\n"))
    }
}

const SUMMARY_INSTRUCTION: &str = "Summarize the conversation below into a short paragraph. \
Keep names, decisions, numbers and open questions. If a previous summary is given, fold it in.";

/// 用 TurnProducer 生成摘要
pub struct ProducerSummarizer {
    producer: Arc<dyn TurnProducer>,
}

impl ProducerSummarizer {
    pub fn new(producer: Arc<dyn TurnProducer>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl Summarizer for ProducerSummarizer {
    async fn summarize(&self, previous: Option<&str>, events: &[Event]) -> Result<String, AgentError> {
        let mut body = String::new();
        if let Some(prev) = previous {
            body.push_str("Previous summary:\n");
            body.push_str(prev);
            body.push_str("\n\n");
        }
        body.push_str("Conversation:\n");
        body.push_str(&transcript(events));

        let request = TurnRequest {
            unit: "compaction".to_string(),
            instruction: SUMMARY_INSTRUCTION.to_string(),
            contents: vec![Message::user(body)],
            tools: Vec::new(),
            state: State::new(),
            memory: Vec::new(),
        };
        Ok(self.producer.produce(&request).await?.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FnProducer;

    fn events() -> Vec<Event> {
        vec![
            Event::new("user").with_content(Message::user("What is an AI agent?")),
            Event::new("researcher").with_content(Message::model("A system that acts.")),
            Event::new("writer"),
        ]
    }

    #[tokio::test]
    async fn test_digest_is_cumulative() {
        let summarizer = DigestSummarizer::new(8);
        let summary = summarizer.summarize(Some("before"), &events()).await.unwrap();
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "before");
        assert_eq!(lines[1], "user: Wh...");
    }

    #[tokio::test]
    async fn test_digest_keeps_only_recent_lines() {
        let summarizer = DigestSummarizer::new(80).with_max_lines(3);
        let mut summary: Option<String> = None;
        for round in 0..10 {
            let batch = vec![
                Event::new("user").with_content(Message::user(format!("question {round}"))),
                Event::new("assistant").with_content(Message::model(format!("answer {round}"))),
            ];
            summary = Some(summarizer.summarize(summary.as_deref(), &batch).await.unwrap());
        }
        let summary = summary.unwrap();
        assert_eq!(
            summary.lines().collect::<Vec<_>>(),
            vec!["assistant: answer 8", "user: question 9", "assistant: answer 9"]
        );
    }

    #[tokio::test]
    async fn test_producer_summarizer_sends_transcript() {
        let producer = Arc::new(FnProducer::new(|req| {
            let body = req.last_user_text().unwrap_or_default();
            assert!(body.contains("researcher: A system that acts."));
            Ok(Message::model("agents act"))
        }));
        let summary = ProducerSummarizer::new(producer)
            .summarize(None, &events())
            .await
            .unwrap();
        assert_eq!(summary, "agents act");
    }
}
