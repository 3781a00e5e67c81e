//! 退出循环工具：调用后外层 LoopUnit 在本轮结束时停止

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{Tool, ToolContext};

pub const EXIT_LOOP: &str = "exit_loop";

pub struct ExitLoopTool;

#[async_trait]
impl Tool for ExitLoopTool {
    fn name(&self) -> &str {
        EXIT_LOOP
    }

    fn description(&self) -> &str {
        "Call this function ONLY when the work is approved, signaling the loop should end."
    }

    async fn execute(&self, _args: Value, ctx: &mut ToolContext) -> Result<Value, String> {
        ctx.signal_termination();
        Ok(json!({ "status": "approved", "message": "Loop exit signaled." }))
    }
}
