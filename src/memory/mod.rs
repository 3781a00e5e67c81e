//! 长期记忆：跨会话检索与归档

pub mod service;
pub mod tools;

pub use service::{InMemoryMemoryService, MemoryService, MemorySnippet};
pub use tools::{AutoSaveMemory, LoadMemoryTool, LOAD_MEMORY};
