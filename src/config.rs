//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SWARM__*` 覆盖（双下划线表示嵌套，如 `SWARM__LOOP__MAX_ITERATIONS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    #[serde(rename = "loop")]
    pub turn_loop: LoopSection,
    pub retry: RetrySection,
    pub dispatch: DispatchSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 文件工具的沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [llm] 段：主推理模型与 worker 池模型
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LlmSection {
    pub primary: ProviderSection,
    pub worker: ProviderSection,
}

/// 单个 Provider：openai（OpenAI 兼容端点）/ mock
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// [loop] 段：TurnLoop 行为
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopSection {
    /// 最多执行的工具批次数
    pub max_iterations: usize,
    /// 是否走 Provider 的流式接口（推送增量文本事件）
    pub streaming: bool,
    /// 「直接回复用户」的终止工具名；空字符串表示不启用
    pub terminal_tool: String,
}

impl Default for LoopSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            streaming: false,
            terminal_tool: "respond_to_user".to_string(),
        }
    }
}

/// [retry] 段：Provider 调用重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

/// [dispatch] 段：子智能体调度
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// 单个子任务超时（秒）
    pub task_timeout_secs: u64,
    /// 单个子任务的最大工具批次数
    pub max_iterations: usize,
    /// 同时运行的子任务上限；不设则全部同时启动
    pub max_concurrency: Option<usize>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            task_timeout_secs: 600,
            max_iterations: 8,
            max_concurrency: None,
        }
    }
}

/// [tools] 段：工具超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

impl AppConfig {
    /// 沙箱根目录
    pub fn workspace_root(&self) -> PathBuf {
        self.app
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }

    /// 终止工具名（空串视为未启用）
    pub fn terminal_tool(&self) -> Option<String> {
        let name = self.turn_loop.terminal_tool.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}

/// 从 config 目录加载配置，环境变量 SWARM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SWARM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
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
        config::Environment::with_prefix("SWARM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
