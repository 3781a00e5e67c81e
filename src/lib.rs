//! Hive - Rust 智能体工作流编排引擎
//!
//! 模块划分：
//! - **agent**: Turn Unit 与组合器（Leaf / Sequential / Parallel / Loop / Remote）
//! - **compaction**: 事件历史的周期性摘要与压缩视图
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **confirmation**: 审批门与挂起 / 恢复控制器
//! - **core**: 错误分类、Invocation 生命周期、取消监管
//! - **llm**: TurnProducer 抽象、重试与测试用生成器
//! - **memory**: 长期记忆服务与记忆工具
//! - **observability**: 日志初始化
//! - **runner**: Invocation 驱动、事件日志与追加后钩子
//! - **session**: 事件、分区状态与会话存储
//! - **tools**: Tool 契约、注册表、执行器与内置工具

pub mod agent;
pub mod compaction;
pub mod config;
pub mod confirmation;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod runner;
pub mod session;
pub mod tools;

pub use agent::{LeafUnit, LoopUnit, ParallelUnit, RemoteUnit, SequentialUnit, TurnUnit, Unit};
pub use core::{AgentError, InvocationStatus};
pub use runner::{RunOutcome, Runner, RunnerBuilder};
