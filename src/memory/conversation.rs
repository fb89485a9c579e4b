//! 对话历史
//!
//! 一次 TurnLoop 独占一个 Conversation，只追加不修改。push 时校验：
//! 第一条非 system 消息必须是 user；tool 消息必须引用此前某条 assistant 消息中的调用 id。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::tools::ToolInvocation;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// tool 消息所回应的调用 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// assistant 消息发起的工具调用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// assistant 发起一批工具调用（content 为同一轮的文本，可为空）
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolInvocation>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// 只追加的对话；由单个 TurnLoop 执行独占
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    /// 已出现过的 assistant 调用 id
    invocation_ids: HashSet<String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(prompt: impl Into<String>) -> Self {
        let mut c = Self::new();
        c.messages.push(Message::system(prompt));
        c
    }

    /// 从已有历史重建（逐条校验）
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, AgentError> {
        let mut c = Self::new();
        for m in messages {
            c.push(m)?;
        }
        Ok(c)
    }

    pub fn push(&mut self, msg: Message) -> Result<(), AgentError> {
        let has_non_system = self.messages.iter().any(|m| m.role != Role::System);
        if !has_non_system && msg.role != Role::System && msg.role != Role::User {
            return Err(AgentError::InvalidConversation(format!(
                "first non-system message must be from user, got {:?}",
                msg.role
            )));
        }
        if msg.role == Role::Tool {
            let id = msg.tool_call_id.as_deref().unwrap_or("");
            if !self.invocation_ids.contains(id) {
                return Err(AgentError::InvalidConversation(format!(
                    "tool message references unknown invocation id '{}'",
                    id
                )));
            }
        }
        if msg.role == Role::Assistant {
            self.invocation_ids
                .extend(msg.tool_calls.iter().map(|c| c.id.clone()));
        }
        self.messages.push(msg);
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
