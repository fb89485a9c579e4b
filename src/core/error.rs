//! Agent 错误类型
//!
//! 只有无法在本地恢复的情况才会成为 AgentError：Provider 重试耗尽或致命错误、对话不变量被破坏、配置错误。
//! 工具失败、解析失败、取消与步数耗尽都不是错误（见 TurnLoop 的终态）。

use thiserror::Error;

use crate::llm::LlmError;

/// TurnLoop / 运行时向调用方传播的终止性错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Invalid conversation: {0}")]
    InvalidConversation(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// Provider 侧的错误（用于 UI 区分「模型不可用」与本地问题）
    pub fn is_provider_error(&self) -> bool {
        matches!(self, AgentError::LlmError(_))
    }
}
