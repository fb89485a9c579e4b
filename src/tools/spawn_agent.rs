//! 子智能体委派工具：spawn_agent（单个）与 spawn_agents（批量并发）
//!
//! 两者都交给 AgentDispatcher 执行；只注册在主网关上，worker 网关不含这两个工具。

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::dispatch::{AgentDispatcher, AgentTask};
use crate::tools::{parameters_schema_for, Tool, ToolArgs, ToolError, ToolResult};

/// 调度器自身超时之外留给汇总的余量
const TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SpawnAgentArgs {
    /// 交给子智能体的任务描述
    pub task: String,
    /// 子智能体类型：general / analyst / researcher / coder
    #[serde(rename = "agentType", alias = "agent_type", default = "default_agent_type")]
    pub agent_type: String,
    /// 可选的补充上下文
    #[serde(default)]
    pub context: Option<String>,
}

fn default_agent_type() -> String {
    "general".to_string()
}

impl From<SpawnAgentArgs> for AgentTask {
    fn from(a: SpawnAgentArgs) -> Self {
        let task = AgentTask::new(a.task, a.agent_type);
        match a.context {
            Some(ctx) => task.with_context(ctx),
            None => task,
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SpawnAgentsArgs {
    /// 相互独立、可并发执行的子任务
    pub tasks: Vec<SpawnAgentArgs>,
}

/// spawn_agent：委派单个子任务并等待结果
pub struct SpawnAgentTool {
    dispatcher: AgentDispatcher,
}

impl SpawnAgentTool {
    pub fn new(dispatcher: AgentDispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> &str {
        "Delegate one self-contained sub-task to a worker agent and return its result."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<SpawnAgentArgs>()
    }

    fn timeout(&self, _args: &ToolArgs) -> Option<Duration> {
        Some(self.dispatcher.batch_timeout(1) + TIMEOUT_MARGIN)
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let args: SpawnAgentArgs = args.parse()?;
        let task: AgentTask = args.into();
        let agent_type = task.agent_type.clone();
        let mut results = self.dispatcher.dispatch_all(vec![task]).await;
        let r = results
            .pop()
            .ok_or_else(|| ToolError::Failed("dispatcher returned no result".to_string()))?;
        let out = if r.success {
            ToolResult::ok(r.content)
        } else {
            ToolResult::failure(r.error.unwrap_or_else(|| "sub-agent failed".to_string()))
        };
        Ok(out
            .with_metadata("task_id", r.id)
            .with_metadata("agent_type", agent_type)
            .with_metadata("elapsed_ms", r.elapsed_ms))
    }
}

/// spawn_agents：批量委派，全部结束后返回每个任务的结果（JSON 数组）
pub struct SpawnAgentsTool {
    dispatcher: AgentDispatcher,
}

impl SpawnAgentsTool {
    pub fn new(dispatcher: AgentDispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Tool for SpawnAgentsTool {
    fn name(&self) -> &str {
        "spawn_agents"
    }

    fn description(&self) -> &str {
        "Run several independent sub-tasks concurrently on worker agents. \
Returns one result per task (id, success, content, error, elapsedMs)."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<SpawnAgentsArgs>()
    }

    /// 槽位不足时任务分轮执行，超时按批量大小放宽
    fn timeout(&self, args: &ToolArgs) -> Option<Duration> {
        let n = args
            .get("tasks")
            .and_then(Value::as_array)
            .map_or(1, Vec::len);
        Some(self.dispatcher.batch_timeout(n) + TIMEOUT_MARGIN)
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let args: SpawnAgentsArgs = args.parse()?;
        if args.tasks.is_empty() {
            return Err(ToolError::InvalidArgs("tasks must not be empty".to_string()));
        }
        let tasks: Vec<AgentTask> = args.tasks.into_iter().map(AgentTask::from).collect();
        let results = self.dispatcher.dispatch_all(tasks).await;
        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        let content = serde_json::to_string_pretty(&results)
            .map_err(|e| ToolError::Failed(format!("failed to encode results: {}", e)))?;
        Ok(ToolResult::ok(content)
            .with_metadata("succeeded", succeeded)
            .with_metadata("failed", failed))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::{LlmClient, LlmError, ModelTurn, ScriptedLlmClient};
    use crate::memory::Message;
    use crate::tools::{ToolGateway, ToolRegistry, ToolSpec};

    /// 每轮先睡 5 秒再回答
    struct SlowLlm;

    #[async_trait]
    impl LlmClient for SlowLlm {
        async fn send_turn(
            &self,
            _messages: &[Message],
            _tools: &[ToolSpec],
        ) -> Result<ModelTurn, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ModelTurn::text("slow answer"))
        }
    }

    fn dispatcher(reply: &str) -> AgentDispatcher {
        let llm = Arc::new(ScriptedLlmClient::from_turns(vec![]).with_fallback(reply));
        AgentDispatcher::new(
            llm,
            ToolGateway::new(ToolRegistry::new(), 5),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_spawn_agent_returns_worker_answer() {
        let tool = SpawnAgentTool::new(dispatcher("analysis complete"));
        let args = ToolArgs::new()
            .with("task", "x")
            .with("agentType", "analyst");
        let r = tool.execute(args).await.unwrap();
        assert!(r.success);
        assert_eq!(r.content, "analysis complete");
        assert_eq!(tool.timeout(&ToolArgs::new()), Some(Duration::from_secs(35)));
    }

    #[tokio::test]
    async fn test_spawn_agent_unknown_type_is_failure() {
        let tool = SpawnAgentTool::new(dispatcher("x"));
        let args = ToolArgs::new().with("task", "x").with("agentType", "ghost");
        let r = tool.execute(args).await.unwrap();
        assert!(!r.success);
        assert!(r.error.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_spawn_agents_reports_each_task() {
        let tool = SpawnAgentsTool::new(dispatcher("ok"));
        let args = ToolArgs::from_value(serde_json::json!({
            "tasks": [
                {"task": "a", "agentType": "general"},
                {"task": "b", "agent_type": "coder"},
                {"task": "c", "agentType": "nope"}
            ]
        }))
        .unwrap();
        let r = tool.execute(args).await.unwrap();
        let parsed: Vec<Value> = serde_json::from_str(&r.content).unwrap();
        assert_eq!(parsed.len(), 3);
        let meta = r.metadata.unwrap();
        assert_eq!(meta["succeeded"], 2);
        assert_eq!(meta["failed"], 1);
    }

    #[tokio::test]
    async fn test_spawn_agents_rejects_empty() {
        let tool = SpawnAgentsTool::new(dispatcher("ok"));
        let args = ToolArgs::new().with("tasks", Value::Array(vec![]));
        assert!(matches!(
            tool.execute(args).await,
            Err(ToolError::InvalidArgs(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_larger_than_slots_finishes_through_gateway() {
        // 槽位 1、任务超时 8 秒、三个 5 秒任务：串行需要 15 秒，超过单任务超时 + 余量
        let d = AgentDispatcher::new(
            Arc::new(SlowLlm),
            ToolGateway::new(ToolRegistry::new(), 5),
            Duration::from_secs(8),
        )
        .with_max_concurrency(1);
        let mut reg = ToolRegistry::new();
        reg.register(SpawnAgentsTool::new(d));
        let gateway = ToolGateway::new(reg, 5);

        let args = ToolArgs::from_value(serde_json::json!({
            "tasks": [
                {"task": "a"},
                {"task": "b"},
                {"task": "c"}
            ]
        }))
        .unwrap();
        let r = gateway.execute("spawn_agents", args).await;

        assert!(r.success, "{:?}", r.error);
        let parsed: Vec<Value> = serde_json::from_str(&r.content).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(parsed.iter().all(|p| p["success"] == true));
    }

    #[test]
    fn test_spawn_agents_timeout_scales_with_batch() {
        let d = dispatcher("ok").with_max_concurrency(2);
        let tool = SpawnAgentsTool::new(d);
        let five = ToolArgs::from_value(serde_json::json!({
            "tasks": [{"task": "1"}, {"task": "2"}, {"task": "3"}, {"task": "4"}, {"task": "5"}]
        }))
        .unwrap();
        // ceil(5 / 2) = 3 轮，每轮 30 秒
        assert_eq!(tool.timeout(&five), Some(Duration::from_secs(95)));
        assert_eq!(tool.timeout(&ToolArgs::new()), Some(Duration::from_secs(35)));
    }
}
