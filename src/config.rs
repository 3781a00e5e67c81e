//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__COMPACTION__OVERLAP_SIZE=2`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::RetryConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub runner: RunnerSection,
    pub tools: ToolsSection,
    pub session: SessionSection,
    pub compaction: CompactionSection,
    pub confirmation: ConfirmationSection,
    pub memory: MemorySection,
    pub retry: RetryConfig,
}

/// [app] 段：应用名（会话按应用隔离）
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
}

fn default_app_name() -> String {
    "hive".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
        }
    }
}

/// [runner] 段：单个 LeafUnit 每轮最多的生成步数
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_max_steps() -> usize {
    20
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
        }
    }
}

/// [tools] 段：工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [session] 段：设置 store_dir 时使用 JSON 文件存储，否则使用内存
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionSection {
    pub store_dir: Option<PathBuf>,
}

/// [compaction] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CompactionSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval: usize,
    #[serde(default = "default_overlap_size")]
    pub overlap_size: usize,
}

fn default_compaction_interval() -> usize {
    3
}

fn default_overlap_size() -> usize {
    1
}

impl Default for CompactionSection {
    fn default() -> Self {
        Self {
            enabled: false,
            compaction_interval: default_compaction_interval(),
            overlap_size: default_overlap_size(),
        }
    }
}

/// [confirmation] 段：按工具名配置的阈值门
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfirmationSection {
    #[serde(default)]
    pub gates: Vec<GateSection>,
}

/// `[[confirmation.gates]]`：`args[field] > threshold` 时需要人工确认
#[derive(Debug, Clone, Deserialize)]
pub struct GateSection {
    pub tool: String,
    pub field: String,
    pub threshold: f64,
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

fn default_max_entries() -> usize {
    1000
}

fn default_search_limit() -> usize {
    5
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            search_limit: default_search_limit(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；调用方决定是否用新配置重建 Runner
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
