//! 工具层：Tool 契约、注册表、执行器与内置工具

pub mod agent_tool;
pub mod context;
pub mod executor;
pub mod exit_loop;
pub mod registry;
pub mod schema;

pub use agent_tool::AgentTool;
pub use context::{ConfirmationAsk, ToolContext};
pub use executor::ToolExecutor;
pub use exit_loop::{ExitLoopTool, EXIT_LOOP};
pub use registry::{Tool, ToolRegistry};
pub use schema::{schema_of, validate_args};
