//! TurnLoop 状态机与单次循环的计数状态
//!
//! Sending → Inspecting → ExecutingTools → Sending … 直到 Done / Cancelled / IterationLimitReached。
//! IterationState 只属于一次循环执行，不在并发循环之间共享。

use serde::Serialize;

/// 循环所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Sending,
    Inspecting,
    ExecutingTools,
    Done,
    Cancelled,
    IterationLimitReached,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::Done | LoopState::Cancelled | LoopState::IterationLimitReached
        )
    }
}

/// 循环的正常终态（致命错误以 Err 返回，不在此列）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopOutcome {
    Done,
    Cancelled,
    IterationLimitReached,
}

/// 单次循环的计数器
#[derive(Debug, Clone)]
pub struct IterationState {
    /// 已完成的工具批次数
    pub iteration_count: usize,
    pub max_iterations: usize,
    /// 每个工具结果的摘要（`name: observation`），用于步数耗尽时决定是否总结
    pub accumulated_tool_outputs: Vec<String>,
    pub cancelled: bool,
    state: LoopState,
}

impl IterationState {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            iteration_count: 0,
            max_iterations: max_iterations.max(1),
            accumulated_tool_outputs: Vec::new(),
            cancelled: false,
            state: LoopState::Sending,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn transition(&mut self, next: LoopState) {
        tracing::debug!(from = ?self.state, to = ?next, iteration = self.iteration_count, "loop transition");
        if next == LoopState::Cancelled {
            self.cancelled = true;
        }
        self.state = next;
    }

    /// 一批工具执行完毕
    pub fn complete_batch(&mut self) {
        self.iteration_count += 1;
    }

    pub fn is_exhausted(&self) -> bool {
        self.iteration_count >= self.max_iterations
    }

    pub fn record_output(&mut self, tool: &str, observation: &str) {
        self.accumulated_tool_outputs
            .push(format!("{}: {}", tool, observation));
    }
}
