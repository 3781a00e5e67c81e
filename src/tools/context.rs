//! 工具执行上下文
//!
//! 工具通过 ToolContext 读写状态、请求人工确认、发出循环终止信号。
//! 写入的增量与终止信号随工具结果事件一起追加。

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::Services;
use crate::memory::MemoryService;
use crate::session::{SessionKey, State, StateDelta};

/// 工具主动发起的确认请求
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationAsk {
    pub hint: String,
    pub payload: Value,
}

pub struct ToolContext {
    pub session: SessionKey,
    pub invocation_id: String,
    /// 调用该工具的单元名
    pub unit: String,
    state: State,
    decision: Option<bool>,
    delta: StateDelta,
    confirmation: Option<ConfirmationAsk>,
    terminate: bool,
    memory: Option<Arc<dyn MemoryService>>,
    services: Option<(Services, CancellationToken)>,
}

impl ToolContext {
    pub fn new(
        session: SessionKey,
        invocation_id: impl Into<String>,
        unit: impl Into<String>,
        state: State,
    ) -> Self {
        Self {
            session,
            invocation_id: invocation_id.into(),
            unit: unit.into(),
            state,
            decision: None,
            delta: StateDelta::new(),
            confirmation: None,
            terminate: false,
            memory: None,
            services: None,
        }
    }

    /// 恢复执行时附带的外部决定
    pub fn with_decision(mut self, decision: Option<bool>) -> Self {
        self.decision = decision;
        self
    }

    pub fn with_memory(mut self, memory: Option<Arc<dyn MemoryService>>) -> Self {
        self.memory = memory;
        self
    }

    /// 调用方单元的协作者与取消令牌（AgentTool 据此运行子单元）
    pub fn with_services(mut self, services: Services, cancel: CancellationToken) -> Self {
        self.services = Some((services, cancel));
        self
    }

    pub fn services(&self) -> Option<(Services, CancellationToken)> {
        self.services.clone()
    }

    /// 当前可见状态（含本次调用已写入的增量）
    pub fn state(&self) -> State {
        let mut state = self.state.clone();
        state.apply(&self.delta);
        state
    }

    /// 读取状态；本次调用中已写入的值优先
    pub fn get_state(&self, key: &str) -> Option<Value> {
        match self.delta.get(key) {
            Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
            None => self.state.get(key).cloned(),
        }
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.delta.set(key, value);
    }

    /// 请求人工确认：工具应随后返回一个 pending 结果，Invocation 将被挂起
    pub fn request_confirmation(&mut self, hint: impl Into<String>, payload: Value) {
        self.confirmation = Some(ConfirmationAsk {
            hint: hint.into(),
            payload,
        });
    }

    /// 恢复后的决定；首次调用时为 None
    pub fn confirmation_decision(&self) -> Option<bool> {
        self.decision
    }

    /// 通知外层循环在本轮结束后停止
    pub fn signal_termination(&mut self) {
        self.terminate = true;
    }

    pub fn memory(&self) -> Option<Arc<dyn MemoryService>> {
        self.memory.clone()
    }

    pub fn delta(&self) -> &StateDelta {
        &self.delta
    }

    pub fn take_delta(&mut self) -> StateDelta {
        std::mem::take(&mut self.delta)
    }

    pub fn take_confirmation(&mut self) -> Option<ConfirmationAsk> {
        self.confirmation.take()
    }

    pub fn terminated(&self) -> bool {
        self.terminate
    }
}
