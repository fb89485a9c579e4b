//! Headless Agent 运行时
//!
//! 按配置装配：主 / worker Provider → worker 网关（只读文件 + echo）→ AgentDispatcher →
//! 主网关（worker 工具 + spawn_agent / spawn_agents）→ TurnLoop。
//! process_message 每次顶层请求重置一次取消控制器，并把新令牌交给本次循环。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{AgentError, CancellationController, RetryPolicy};
use crate::dispatch::AgentDispatcher;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{Conversation, Message};
use crate::react::{EventSender, LoopConfig, LoopResult, TurnLoop};
use crate::tools::{
    EchoTool, ListDirTool, ReadFileTool, SpawnAgentTool, SpawnAgentsTool, ToolGateway,
    ToolRegistry,
};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable assistant that solves multi-step tasks with tools. \
Call tools when you need information from the workspace. For independent sub-tasks, delegate with \
spawn_agent or spawn_agents. When you have the final answer, call respond_to_user(message) or reply in plain text.";

/// 无界面运行时：可多次调用 process_message
pub struct AgentRuntime {
    turn_loop: TurnLoop,
    dispatcher: AgentDispatcher,
    cancel: Arc<CancellationController>,
    system_prompt: String,
}

impl AgentRuntime {
    /// 从配置创建 Provider 并装配
    pub fn from_config(cfg: &AppConfig) -> Self {
        let primary = create_llm_from_config("primary", &cfg.llm.primary);
        let worker = create_llm_from_config("worker", &cfg.llm.worker);
        Self::new(cfg, primary, worker)
    }

    /// 以给定 Provider 装配（测试可注入 ScriptedLlmClient）
    pub fn new(cfg: &AppConfig, primary: Arc<dyn LlmClient>, worker: Arc<dyn LlmClient>) -> Self {
        let root = cfg.workspace_root();
        if let Err(e) = std::fs::create_dir_all(&root) {
            tracing::warn!(path = %root.display(), error = %e, "failed to create workspace root");
        }

        let mut worker_tools = ToolRegistry::new();
        worker_tools.register(ReadFileTool::new(&root));
        worker_tools.register(ListDirTool::new(&root));
        worker_tools.register(EchoTool);
        let worker_gateway = ToolGateway::new(worker_tools.clone(), cfg.tools.tool_timeout_secs);

        let dispatcher = AgentDispatcher::from_config(worker, worker_gateway, cfg);

        let mut tools = worker_tools;
        tools.register(SpawnAgentTool::new(dispatcher.clone()));
        tools.register(SpawnAgentsTool::new(dispatcher.clone()));
        let gateway = Arc::new(ToolGateway::new(tools, cfg.tools.tool_timeout_secs));

        let retry = RetryPolicy::new(cfg.retry.max_attempts, cfg.retry.base_delay_ms);
        let turn_loop =
            TurnLoop::new(primary, gateway, LoopConfig::from_config(cfg)).with_retry(retry);

        Self {
            turn_loop,
            dispatcher,
            cancel: Arc::new(CancellationController::new()),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_event_tx(mut self, tx: EventSender) -> Self {
        self.turn_loop = self.turn_loop.with_event_tx(tx);
        self
    }

    pub fn cancellation(&self) -> Arc<CancellationController> {
        Arc::clone(&self.cancel)
    }

    pub fn dispatcher(&self) -> &AgentDispatcher {
        &self.dispatcher
    }

    /// 停止当前顶层请求
    pub fn request_cancellation(&self) {
        self.cancel.request();
    }

    /// 处理一条用户消息；history 为空时以系统提示词开局，否则在已有历史上继续
    pub async fn process_message(
        &self,
        history: Vec<Message>,
        user_input: &str,
    ) -> Result<LoopResult, AgentError> {
        let conversation = if history.is_empty() {
            Conversation::with_system(self.system_prompt.clone())
        } else {
            Conversation::from_messages(history)?
        };
        let token = self.cancel.reset();
        tracing::info!(input_chars = user_input.chars().count(), "processing message");
        self.turn_loop.run(conversation, user_input, token).await
    }
}
