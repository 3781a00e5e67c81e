//! 会话层：消息、命名空间状态、事件日志与会话存储

pub mod event;
pub mod message;
pub mod persistence;
pub mod service;
pub mod state;

pub use event::{
    is_under, CompactionRecord, ConfirmationRequest, ConfirmationResponse, Event, EventActions,
    USER_AUTHOR,
};
pub use message::{Message, Part, Role, ToolCall, ToolResult};
pub use persistence::JsonFileSessionService;
pub use service::{InMemorySessionService, Session, SessionKey, SessionService};
pub use state::{Scope, State, StateDelta, APP_PREFIX, TEMP_PREFIX, USER_PREFIX};
