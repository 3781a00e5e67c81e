//! 确认 / 恢复：审批门与挂起恢复控制器

pub mod controller;
pub mod gate;

pub use controller::{
    confirmation_message, pending_invocation, response_from_message, unresolved_requests,
    ConfirmationController, DEFAULT_FINISHED_HISTORY, REQUEST_CONFIRMATION,
};
pub use gate::{Approval, ApprovalGate, ThresholdGate};
