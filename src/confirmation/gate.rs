//! 审批门：对工具调用参数的纯判定
//!
//! 在任何挂起检查之前求值；自动通过的调用不会进入挂起路径。判定只依赖参数，幂等且与顺序无关。

use serde::Deserialize;
use serde_json::{json, Value};

use crate::session::ToolCall;

/// 判定结果
#[derive(Debug, Clone, PartialEq)]
pub enum Approval {
    Auto,
    Required { hint: String, payload: Value },
}

/// 审批门 trait
pub trait ApprovalGate: Send + Sync {
    fn evaluate(&self, call: &ToolCall) -> Approval;
}

/// 阈值门：当 `args[field] > threshold` 时需要确认；字段缺失或非数值时自动通过
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThresholdGate {
    pub field: String,
    pub threshold: f64,
}

impl ThresholdGate {
    pub fn new(field: impl Into<String>, threshold: f64) -> Self {
        Self {
            field: field.into(),
            threshold,
        }
    }
}

impl ApprovalGate for ThresholdGate {
    fn evaluate(&self, call: &ToolCall) -> Approval {
        match call.args.get(&self.field).and_then(Value::as_f64) {
            Some(value) if value > self.threshold => Approval::Required {
                hint: format!(
                    "{} requested with {} = {}, above the auto-approval threshold of {}. Approve?",
                    call.name, self.field, value, self.threshold
                ),
                payload: json!({
                    "tool": call.name,
                    "args": call.args,
                    "field": self.field,
                    "threshold": self.threshold,
                }),
            },
            _ => Approval::Auto,
        }
    }
}
