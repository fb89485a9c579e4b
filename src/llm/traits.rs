//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：send_turn（一次性）与 send_turn_stream（先增量文本、最后完整轮次）。
//! 一轮的结果统一为 ModelTurn：可能为空的文本 + 零或多个结构化工具调用。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{is_retryable_status, is_transient_message, IsRetryable};
use crate::memory::Message;
use crate::tools::{ToolInvocation, ToolSpec};

/// Provider 错误；重试策略依据 IsRetryable 区分可恢复与致命
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("{0}")]
    Other(String),
}

impl IsRetryable for LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Network(_) | LlmError::Timeout => true,
            LlmError::Http { status, .. } => is_retryable_status(*status),
            LlmError::Other(msg) => is_transient_message(msg),
            LlmError::Auth(_) | LlmError::InvalidRequest(_) | LlmError::MalformedResponse(_) => {
                false
            }
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

/// 一轮模型输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTurn {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
}

impl ModelTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_calls(text: impl Into<String>, calls: Vec<ToolInvocation>) -> Self {
        Self {
            text: text.into(),
            tool_calls: calls,
        }
    }
}

/// 流式输出的一段
#[derive(Debug, Clone, PartialEq)]
pub enum TurnChunk {
    /// 增量文本
    Text(String),
    /// 最终完整轮次（含结构化调用）
    Done(ModelTurn),
}

pub type TurnStream = Pin<Box<dyn Stream<Item = Result<TurnChunk, LlmError>> + Send>>;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 后端名（日志用）
    fn name(&self) -> &str {
        "llm"
    }

    /// 一次性完成一轮
    async fn send_turn(&self, messages: &[Message], tools: &[ToolSpec])
        -> Result<ModelTurn, LlmError>;

    /// 流式完成一轮；默认把 send_turn 的结果包装为「一段文本 + Done」
    async fn send_turn_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<TurnStream, LlmError> {
        let turn = self.send_turn(messages, tools).await?;
        let mut chunks = Vec::with_capacity(2);
        if !turn.text.is_empty() {
            chunks.push(Ok(TurnChunk::Text(turn.text.clone())));
        }
        chunks.push(Ok(TurnChunk::Done(turn)));
        Ok(Box::pin(stream::iter(chunks)))
    }

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 消费一条轮次流：每段文本回调 on_text；流结束却没有 Done 时用累计文本补成一轮（无结构化调用）
pub async fn collect_turn<F>(mut stream: TurnStream, mut on_text: F) -> Result<ModelTurn, LlmError>
where
    F: FnMut(&str),
{
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            TurnChunk::Text(delta) => {
                on_text(&delta);
                text.push_str(&delta);
            }
            TurnChunk::Done(mut turn) => {
                if turn.text.is_empty() {
                    turn.text = text;
                }
                return Ok(turn);
            }
        }
    }
    Ok(ModelTurn::text(text))
}
