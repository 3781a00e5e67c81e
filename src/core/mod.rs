//! 核心层：错误分类、Invocation 生命周期、取消监管

pub mod error;
pub mod invocation;
pub mod session_supervisor;

pub use error::{AgentError, ErrorInfo, ErrorKind};
pub use invocation::{Invocation, InvocationId, InvocationStatus};
pub use session_supervisor::SessionSupervisor;
