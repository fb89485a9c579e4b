//! 循环过程事件：供 UI / SSE 展示思考、工具执行、增量文本与终态
//!
//! 每个事件带时间戳；工具相关事件携带调用的 name 与 args。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// 正在调用 LLM 思考（第几轮工具批次之后）
    ThinkingStarted {
        iteration: usize,
        max_iterations: usize,
    },
    /// 本轮即将执行 N 个工具
    ToolsStarting { count: usize },
    /// 某个工具开始执行
    ToolExecuting {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// 某个工具执行结束（预览，避免过长）
    ToolCompleted {
        id: String,
        name: String,
        args: serde_json::Value,
        success: bool,
        preview: String,
    },
    /// 模型输出的增量文本
    TextChunk { text: String },
    /// 达到最大工具批次数，进入总结
    IterationLimitReached { iterations: usize },
    /// 最终回复
    Done { response: String },
    /// 请求已取消
    Cancelled,
    /// 错误
    Error { text: String },
}

/// 带时间戳的事件
#[derive(Debug, Clone, Serialize)]
pub struct LoopEventEnvelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LoopEvent,
}

impl LoopEventEnvelope {
    pub fn now(event: LoopEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<LoopEventEnvelope>;

/// 发送事件；接收端已关闭时静默丢弃
pub(crate) fn send_event(tx: &Option<EventSender>, event: LoopEvent) {
    if let Some(t) = tx {
        let _ = t.send(LoopEventEnvelope::now(event));
    }
}

/// 截断到 max 个字符，超出时追加 "..."
pub(crate) fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}
