//! Swarm - 多轮工具调用编排核心
//!
//! 模块划分：
//! - **agent**: 无头运行时（装配 Provider / 网关 / 调度器 / 主循环）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、重试策略、取消控制
//! - **dispatch**: 子智能体并发调度与结果汇总
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息与对话历史不变量
//! - **observability**: tracing 初始化
//! - **react**: 调用提取、循环状态机与过程事件
//! - **tools**: 工具注册表、网关与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::AgentRuntime;
pub use config::{load_config, AppConfig};
pub use core::{AgentError, CancellationController, RetryPolicy};
pub use dispatch::{AgentDispatcher, AgentResult, AgentTask};
pub use react::{CallExtractor, LoopOutcome, LoopResult, TurnLoop};
pub use tools::{ToolGateway, ToolResult};
