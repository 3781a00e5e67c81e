//! 命名空间状态：session / user: / app: / temp:
//!
//! State 按作用域分区存储；StateDelta 是部分映射，随所属 Event 追加时原子合并（null 表示删除）。
//! 所有变更都挂在事件上，因此按日志顺序重放增量即可完整重建状态。

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Event;

pub const USER_PREFIX: &str = "user:";
pub const APP_PREFIX: &str = "app:";
pub const TEMP_PREFIX: &str = "temp:";

/// 状态作用域
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// 会话内（无前缀）
    Session,
    /// 同一用户的所有会话共享
    User,
    /// 同一应用的所有会话共享
    App,
    /// 仅在当前 Invocation 内有效，结束时清除
    Temp,
}

impl Scope {
    pub fn prefix(self) -> &'static str {
        match self {
            Scope::Session => "",
            Scope::User => USER_PREFIX,
            Scope::App => APP_PREFIX,
            Scope::Temp => TEMP_PREFIX,
        }
    }

    /// 解析完整 key，返回 (作用域, 去前缀后的名字)
    pub fn parse(key: &str) -> (Scope, &str) {
        for scope in [Scope::User, Scope::App, Scope::Temp] {
            if let Some(name) = key.strip_prefix(scope.prefix()) {
                return (scope, name);
            }
        }
        (Scope::Session, key)
    }

    /// 给名字加上作用域前缀
    pub fn key(self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }
}

/// 状态增量：完整 key -> 新值；Value::Null 表示删除该 key
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta(BTreeMap<String, Value>);

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), Value::Null);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// 合并另一份增量，后者覆盖前者
    pub fn merge(&mut self, other: &StateDelta) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

/// 分区状态快照
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    session: BTreeMap<String, Value>,
    #[serde(default)]
    user: BTreeMap<String, Value>,
    #[serde(default)]
    app: BTreeMap<String, Value>,
    #[serde(default)]
    temp: BTreeMap<String, Value>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按日志顺序重放所有事件的增量
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut state = Self::new();
        for event in events {
            state.apply(&event.actions.state_delta);
        }
        state
    }

    fn scope_map(&self, scope: Scope) -> &BTreeMap<String, Value> {
        match scope {
            Scope::Session => &self.session,
            Scope::User => &self.user,
            Scope::App => &self.app,
            Scope::Temp => &self.temp,
        }
    }

    fn scope_map_mut(&mut self, scope: Scope) -> &mut BTreeMap<String, Value> {
        match scope {
            Scope::Session => &mut self.session,
            Scope::User => &mut self.user,
            Scope::App => &mut self.app,
            Scope::Temp => &mut self.temp,
        }
    }

    /// 按完整 key（含前缀）读取
    pub fn get(&self, key: &str) -> Option<&Value> {
        let (scope, name) = Scope::parse(key);
        self.scope_map(scope).get(name)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// 读取并反序列化为指定类型
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn session_value(&self, name: &str) -> Option<&Value> {
        self.session.get(name)
    }

    pub fn user_value(&self, name: &str) -> Option<&Value> {
        self.user.get(name)
    }

    pub fn app_value(&self, name: &str) -> Option<&Value> {
        self.app.get(name)
    }

    pub fn temp_value(&self, name: &str) -> Option<&Value> {
        self.temp.get(name)
    }

    /// 合并增量；null 删除 key
    pub fn apply(&mut self, delta: &StateDelta) {
        for (key, value) in delta.iter() {
            let (scope, name) = Scope::parse(key);
            let map = self.scope_map_mut(scope);
            if value.is_null() {
                map.remove(name);
            } else {
                map.insert(name.to_string(), value.clone());
            }
        }
    }

    /// 只保留指定作用域
    pub fn only(&self, scopes: &[Scope]) -> State {
        let mut out = State::new();
        for scope in scopes {
            *out.scope_map_mut(*scope) = self.scope_map(*scope).clone();
        }
        out
    }

    /// 用 other 的对应分区整体替换本分区（共享的 user / app 状态叠加到会话视图上）
    pub fn replace_scope(&mut self, scope: Scope, other: &State) {
        *self.scope_map_mut(scope) = other.scope_map(scope).clone();
    }

    /// 某作用域下的完整 key 列表
    pub fn keys(&self, scope: Scope) -> Vec<String> {
        self.scope_map(scope).keys().map(|k| scope.key(k)).collect()
    }

    /// 清除所有 temp: key 的增量（Invocation 结束时追加）
    pub fn clear_temp_delta(&self) -> StateDelta {
        let mut delta = StateDelta::new();
        for key in self.keys(Scope::Temp) {
            delta.remove(key);
        }
        delta
    }

    /// 扁平化为完整 key -> value
    pub fn to_flat(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for scope in [Scope::Session, Scope::User, Scope::App, Scope::Temp] {
            for (k, v) in self.scope_map(scope) {
                out.insert(scope.key(k), v.clone());
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.session.is_empty() && self.user.is_empty() && self.app.is_empty() && self.temp.is_empty()
    }
}
