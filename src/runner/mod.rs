//! Runner：Invocation 驱动、事件日志与追加后钩子

pub mod hooks;
pub mod log;
pub mod runtime;

pub use hooks::{HookContext, LoggingPlugin, RunnerHook};
pub use log::EventLog;
pub use runtime::{RunOutcome, Runner, RunnerBuilder, RUNNER_AUTHOR};
