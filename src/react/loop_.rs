//! TurnLoop 主循环
//!
//! Sending -> Inspecting -> ExecutingTools -> Sending …，直到 Done / Cancelled / IterationLimitReached。
//! - 每次发送前、收到响应后、每个工具执行前检查取消令牌；取消后不再发起任何 Provider 请求或工具调用
//! - Provider 调用经 RetryPolicy（退避期间可被取消打断）；不可恢复错误以 Err 返回，本次对话历史丢弃
//! - 同一批工具严格按提取顺序串行执行，结果按同样顺序写回对话
//! - 可选 event_tx：推送 ThinkingStarted / ToolExecuting / ToolCompleted / TextChunk / Done 等事件

use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, RetryPolicy};
use crate::llm::{collect_turn, LlmClient, LlmError, ModelTurn};
use crate::memory::{Conversation, Message};
use crate::react::events::{preview, send_event, EventSender, LoopEvent};
use crate::react::state::{IterationState, LoopOutcome, LoopState};
use crate::react::CallExtractor;
use crate::tools::{parameters_schema_for, ToolGateway, ToolInvocation, ToolResult, ToolSpec};

/// 工具结果预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

const DEFAULT_SYNTHESIS_PROMPT: &str = "You have reached the maximum number of tool steps. \
Do not call any more tools. Using the tool results above, write your best final answer to the original request.";

/// 终止工具参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RespondArgs {
    /// 给用户的最终回复
    pub message: String,
}

/// 循环配置
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// 最多执行的工具批次数
    pub max_iterations: usize,
    /// 走 Provider 流式接口并推送 TextChunk
    pub streaming: bool,
    /// 「直接回复用户」的终止工具名
    pub terminal_tool: Option<String>,
    /// 步数耗尽时追加的总结提示
    pub synthesis_prompt: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            streaming: false,
            terminal_tool: Some("respond_to_user".to_string()),
            synthesis_prompt: DEFAULT_SYNTHESIS_PROMPT.to_string(),
        }
    }
}

impl LoopConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_iterations: cfg.turn_loop.max_iterations,
            streaming: cfg.turn_loop.streaming,
            terminal_tool: cfg.terminal_tool(),
            ..Self::default()
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// 循环执行结果：终态、最终回复与完整对话历史
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub outcome: LoopOutcome,
    pub response: String,
    pub messages: Vec<Message>,
    /// 已完成的工具批次数
    pub iterations: usize,
}

/// 会话级推理循环：LLM + 工具网关 + 调用提取 + 重试
pub struct TurnLoop {
    llm: Arc<dyn LlmClient>,
    gateway: Arc<ToolGateway>,
    extractor: CallExtractor,
    retry: RetryPolicy,
    config: LoopConfig,
    event_tx: Option<EventSender>,
}

impl TurnLoop {
    pub fn new(llm: Arc<dyn LlmClient>, gateway: Arc<ToolGateway>, config: LoopConfig) -> Self {
        let mut whitelist = gateway.tool_names();
        if let Some(t) = &config.terminal_tool {
            if !whitelist.contains(t) {
                whitelist.push(t.clone());
            }
        }
        Self {
            llm,
            gateway,
            extractor: CallExtractor::new(whitelist),
            retry: RetryPolicy::default(),
            config,
            event_tx: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_extractor(mut self, extractor: CallExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_event_tx(mut self, tx: EventSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// 发给 Provider 的工具列表：网关工具 + 终止工具
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs = self.gateway.list_tools();
        if let Some(name) = &self.config.terminal_tool {
            if !specs.iter().any(|s| &s.name == name) {
                specs.push(ToolSpec {
                    name: name.clone(),
                    description: "Send the final answer to the user and end this turn.".to_string(),
                    parameters: parameters_schema_for::<RespondArgs>(),
                });
            }
        }
        specs
    }

    /// 以 user_input 开启一轮，循环直到终态
    pub async fn run(
        &self,
        mut conversation: Conversation,
        user_input: &str,
        cancel: CancellationToken,
    ) -> Result<LoopResult, AgentError> {
        conversation.push(Message::user(user_input))?;
        let mut state = IterationState::new(self.config.max_iterations);
        let tools = self.tool_specs();

        loop {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(conversation, &mut state));
            }
            state.transition(LoopState::Sending);
            send_event(
                &self.event_tx,
                LoopEvent::ThinkingStarted {
                    iteration: state.iteration_count,
                    max_iterations: state.max_iterations,
                },
            );

            let turn = match self.send(conversation.messages(), &tools, &cancel).await {
                Ok(t) => t,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Ok(self.cancelled(conversation, &mut state));
                    }
                    send_event(&self.event_tx, LoopEvent::Error { text: e.to_string() });
                    return Err(e.into());
                }
            };

            state.transition(LoopState::Inspecting);
            if cancel.is_cancelled() {
                return Ok(self.cancelled(conversation, &mut state));
            }

            let calls = self.extractor.extract(&turn);
            if let Some(answer) = self.terminal_answer(&calls, &turn) {
                conversation.push(Message::assistant(answer.clone()))?;
                return Ok(self.finish(conversation, &mut state, LoopOutcome::Done, answer));
            }
            if calls.is_empty() {
                let answer = turn.text.trim().to_string();
                conversation.push(Message::assistant(answer.clone()))?;
                return Ok(self.finish(conversation, &mut state, LoopOutcome::Done, answer));
            }

            state.transition(LoopState::ExecutingTools);
            conversation.push(Message::assistant_with_calls(turn.text.clone(), calls.clone()))?;
            send_event(&self.event_tx, LoopEvent::ToolsStarting { count: calls.len() });

            let mut pending = calls.into_iter();
            while let Some(call) = pending.next() {
                if cancel.is_cancelled() {
                    // 每个已声明的调用都要有对应的工具消息
                    for skipped in std::iter::once(call).chain(pending.by_ref()) {
                        let r = ToolResult::failure("cancelled before execution");
                        conversation.push(Message::tool(skipped.id, r.to_observation()))?;
                    }
                    return Ok(self.cancelled(conversation, &mut state));
                }
                let observation = self.execute_one(&call).await;
                state.record_output(&call.name, &observation);
                conversation.push(Message::tool(call.id, observation))?;
            }

            state.complete_batch();
            tracing::debug!(
                iteration = state.iteration_count,
                max = state.max_iterations,
                "tool batch completed"
            );
            if state.is_exhausted() {
                return self.conclude_at_limit(conversation, &mut state, &cancel).await;
            }
        }
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, LlmError> {
        self.retry
            .run_cancellable(cancel, move |attempt| async move {
                if attempt > 1 {
                    tracing::debug!(attempt, provider = self.llm.name(), "resending turn");
                }
                if self.config.streaming {
                    let stream = self.llm.send_turn_stream(messages, tools).await?;
                    collect_turn(stream, |delta| {
                        send_event(
                            &self.event_tx,
                            LoopEvent::TextChunk {
                                text: delta.to_string(),
                            },
                        )
                    })
                    .await
                } else {
                    self.llm.send_turn(messages, tools).await
                }
            })
            .await
    }

    async fn execute_one(&self, call: &ToolInvocation) -> String {
        let args_value = call.args.as_value();
        send_event(
            &self.event_tx,
            LoopEvent::ToolExecuting {
                id: call.id.clone(),
                name: call.name.clone(),
                args: args_value.clone(),
            },
        );
        let result = self.gateway.execute(&call.name, call.args.clone()).await;
        let observation = result.to_observation();
        send_event(
            &self.event_tx,
            LoopEvent::ToolCompleted {
                id: call.id.clone(),
                name: call.name.clone(),
                args: args_value,
                success: result.success,
                preview: preview(&observation, OBSERVATION_PREVIEW_CHARS),
            },
        );
        observation
    }

    /// 终止工具优先于同轮其余调用；参数缺失时退回模型文本
    fn terminal_answer(&self, calls: &[ToolInvocation], turn: &ModelTurn) -> Option<String> {
        let name = self.config.terminal_tool.as_deref()?;
        let call = calls.iter().find(|c| c.name == name)?;
        let answer = ["message", "content", "text"]
            .iter()
            .find_map(|k| call.args.get_str(k))
            .map(str::to_string)
            .unwrap_or_else(|| turn.text.trim().to_string());
        Some(answer)
    }

    /// 步数耗尽：有工具结果时再请求一次（不带工具）总结，失败或无结果时用兜底文案
    async fn conclude_at_limit(
        &self,
        mut conversation: Conversation,
        state: &mut IterationState,
        cancel: &CancellationToken,
    ) -> Result<LoopResult, AgentError> {
        if cancel.is_cancelled() {
            return Ok(self.cancelled(conversation, state));
        }
        state.transition(LoopState::IterationLimitReached);
        send_event(
            &self.event_tx,
            LoopEvent::IterationLimitReached {
                iterations: state.iteration_count,
            },
        );
        tracing::warn!(iterations = state.iteration_count, "iteration limit reached");

        let mut response = String::new();
        if !state.accumulated_tool_outputs.is_empty() {
            conversation.push(Message::user(self.config.synthesis_prompt.clone()))?;
            match self.send(conversation.messages(), &[], cancel).await {
                Ok(turn) => response = turn.text.trim().to_string(),
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Ok(self.cancelled(conversation, state));
                    }
                    tracing::warn!(error = %e, "synthesis request failed, using fallback");
                }
            }
        }
        if response.is_empty() {
            response = fallback_answer(state);
        }
        conversation.push(Message::assistant(response.clone()))?;
        Ok(self.finish(
            conversation,
            state,
            LoopOutcome::IterationLimitReached,
            response,
        ))
    }

    fn cancelled(&self, conversation: Conversation, state: &mut IterationState) -> LoopResult {
        state.transition(LoopState::Cancelled);
        send_event(&self.event_tx, LoopEvent::Cancelled);
        tracing::info!(iterations = state.iteration_count, "turn loop cancelled");
        LoopResult {
            outcome: LoopOutcome::Cancelled,
            response: "Request cancelled.".to_string(),
            messages: conversation.into_messages(),
            iterations: state.iteration_count,
        }
    }

    fn finish(
        &self,
        conversation: Conversation,
        state: &mut IterationState,
        outcome: LoopOutcome,
        response: String,
    ) -> LoopResult {
        if outcome == LoopOutcome::Done {
            state.transition(LoopState::Done);
        }
        send_event(
            &self.event_tx,
            LoopEvent::Done {
                response: response.clone(),
            },
        );
        LoopResult {
            outcome,
            response,
            messages: conversation.into_messages(),
            iterations: state.iteration_count,
        }
    }
}

fn fallback_answer(state: &IterationState) -> String {
    match state.accumulated_tool_outputs.last() {
        Some(last) => format!(
            "Reached the limit of {} tool steps without a final answer. Last tool result: {}",
            state.max_iterations,
            preview(last, OBSERVATION_PREVIEW_CHARS)
        ),
        None => format!(
            "Reached the limit of {} tool steps without a final answer.",
            state.max_iterations
        ),
    }
}
