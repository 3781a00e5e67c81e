//! 压缩：周期性摘要事件历史，限制生成上下文的长度

pub mod engine;
pub mod summarizer;
pub mod view;

pub use engine::{CompactionConfig, CompactionEngine, COMPACTION_AUTHOR};
pub use summarizer::{
    transcript, DigestSummarizer, ProducerSummarizer, Summarizer, DEFAULT_DIGEST_LINES,
};
pub use view::{context_view, latest_record};
