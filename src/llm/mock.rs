//! Mock LLM 客户端（用于测试与离线模式，无需 API）
//!
//! - MockLlmClient：最后一条是 user 时以文本形式调用 echo，收到工具结果后直接回复，便于本地跑通整个循环。
//! - ScriptedLlmClient：按队列依次返回预设轮次或错误，并记录每次请求，供测试断言。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, ModelTurn};
use crate::memory::{Message, Role};
use crate::tools::ToolSpec;

/// Mock 客户端：先回显用户消息（文本形式工具调用），再根据工具结果作答
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send_turn(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelTurn, LlmError> {
        let last = messages.last();
        if let Some(m) = last.filter(|m| m.role == Role::Tool) {
            return Ok(ModelTurn::text(format!("Echo from Mock: {}", m.content)));
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        if tools.iter().any(|t| t.name == "echo") {
            let escaped = last_user.replace('\\', "\\\\").replace('"', "\\\"");
            Ok(ModelTurn::text(format!("`echo(text=\"{}\")`", escaped)))
        } else {
            Ok(ModelTurn::text(format!("Echo from Mock: {}", last_user)))
        }
    }
}

/// 记录下来的一次请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
}

/// 脚本化客户端：依次弹出预设结果；队列耗尽后返回 fallback 文本
#[derive(Debug)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<ModelTurn, LlmError>>>,
    fallback: String,
    calls: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<ModelTurn, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: "done".to_string(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 全部为成功轮次的脚本
    pub fn from_turns(turns: Vec<ModelTurn>) -> Self {
        Self::new(turns.into_iter().map(Ok).collect())
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    /// 已收到的 send_turn 次数
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send_turn(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelTurn, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedRequest {
                messages: messages.to_vec(),
                tools: tools.iter().map(|t| t.name.clone()).collect(),
            });
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Ok(ModelTurn::text(self.fallback.clone())))
    }
}
