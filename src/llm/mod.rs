//! 生成器层：TurnProducer 抽象、瞬时错误重试与测试用实现

pub mod mock;
pub mod retry;
pub mod traits;

pub use mock::{FnProducer, ScriptedProducer};
pub use retry::{RetryConfig, RetryingProducer};
pub use traits::{ModelError, ToolDeclaration, TurnProducer, TurnRequest, TRANSIENT_STATUS};
