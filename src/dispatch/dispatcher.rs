//! AgentDispatcher：并发运行 N 个相互独立的 worker 循环
//!
//! - 所有任务同时启动（可选信号量限流），等待全部结束后返回
//! - 每个任务独立超时；超时不自动重试，结果为 `{success:false, error:"timed out"}`
//! - 单个任务失败 / 超时 / panic 不影响其他任务；返回恰好一条结果对应一个输入任务（按 id 匹配）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::RetryPolicy;
use crate::dispatch::{builtin_profiles, AgentProfile};
use crate::llm::LlmClient;
use crate::memory::Conversation;
use crate::react::{LoopConfig, LoopOutcome, TurnLoop};
use crate::tools::ToolGateway;

/// 子任务（不可变输入）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub task: String,
    #[serde(rename = "agentType")]
    pub agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl AgentTask {
    pub fn new(task: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            agent_type: agent_type.into(),
            context: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// worker 收到的首条 user 消息
    fn prompt(&self) -> String {
        match &self.context {
            Some(ctx) if !ctx.trim().is_empty() => {
                format!("{}\n\nContext:\n{}", self.task, ctx)
            }
            _ => self.task.clone(),
        }
    }
}

/// 子任务结果（调度器唯一输出）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub id: String,
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
}

impl AgentResult {
    fn ok(id: String, content: String, elapsed_ms: u64) -> Self {
        Self {
            id,
            success: true,
            content,
            error: None,
            elapsed_ms,
        }
    }

    fn failed(id: String, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            id,
            success: false,
            content: String::new(),
            error: Some(error.into()),
            elapsed_ms,
        }
    }
}

struct DispatcherInner {
    llm: Arc<dyn LlmClient>,
    gateway: ToolGateway,
    retry: RetryPolicy,
    task_timeout: Duration,
    max_iterations: usize,
    terminal_tool: Option<String>,
    profiles: HashMap<String, AgentProfile>,
    slots: Option<Arc<Semaphore>>,
    max_concurrency: usize,
}

/// 子智能体调度器（可廉价 Clone，供 spawn_agent 工具持有）
#[derive(Clone)]
pub struct AgentDispatcher {
    inner: Arc<DispatcherInner>,
}

impl AgentDispatcher {
    /// worker 网关不应包含 spawn_agent / spawn_agents
    pub fn new(llm: Arc<dyn LlmClient>, gateway: ToolGateway, task_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                llm,
                gateway,
                retry: RetryPolicy::default(),
                task_timeout,
                max_iterations: 8,
                terminal_tool: Some("respond_to_user".to_string()),
                profiles: builtin_profiles(),
                slots: None,
                max_concurrency: 0,
            }),
        }
    }

    pub fn from_config(llm: Arc<dyn LlmClient>, gateway: ToolGateway, cfg: &AppConfig) -> Self {
        Self::new(
            llm,
            gateway,
            Duration::from_secs(cfg.dispatch.task_timeout_secs),
        )
        .configure(|inner| {
            inner.retry = RetryPolicy::new(cfg.retry.max_attempts, cfg.retry.base_delay_ms);
            inner.max_iterations = cfg.dispatch.max_iterations;
            inner.terminal_tool = cfg.terminal_tool();
            if let Some(n) = cfg.dispatch.max_concurrency.filter(|n| *n > 0) {
                inner.slots = Some(Arc::new(Semaphore::new(n)));
                inner.max_concurrency = n;
            }
        })
    }

    /// 只在尚未被 Clone 共享前生效
    fn configure(mut self, f: impl FnOnce(&mut DispatcherInner)) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => f(inner),
            None => tracing::warn!("dispatcher already shared, configuration ignored"),
        }
        self
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        self.configure(|i| i.retry = retry)
    }

    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        self.configure(|i| i.max_iterations = max_iterations)
    }

    pub fn with_max_concurrency(self, n: usize) -> Self {
        let n = n.max(1);
        self.configure(|i| {
            i.slots = Some(Arc::new(Semaphore::new(n)));
            i.max_concurrency = n;
        })
    }

    pub fn with_profile(self, profile: AgentProfile) -> Self {
        self.configure(|i| {
            i.profiles.insert(profile.name.clone(), profile);
        })
    }

    pub fn task_timeout(&self) -> Duration {
        self.inner.task_timeout
    }

    pub fn agent_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// 一批 n 个任务的最长耗时：有槽位上限时按 ceil(n / 槽位数) 轮计，每轮一个任务超时
    ///
    /// 假定本批独占槽位；调度器被多方同时使用时实际排队可能更久。
    pub fn batch_timeout(&self, n: usize) -> Duration {
        let n = n.max(1);
        let waves = match &self.inner.slots {
            Some(_) => n.div_ceil(self.inner.max_concurrency.max(1)),
            None => 1,
        };
        self.inner
            .task_timeout
            .saturating_mul(u32::try_from(waves).unwrap_or(u32::MAX))
    }

    /// dispatchAll：全部任务同时启动，等待全部结束
    ///
    /// 任务放在 JoinSet 中：返回前被丢弃（如外层超时）时，尚未结束的 worker 随之中止。
    pub async fn dispatch_all(&self, tasks: Vec<AgentTask>) -> Vec<AgentResult> {
        tracing::info!(count = tasks.len(), "dispatching sub-agents");
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();

        let mut set = JoinSet::new();
        for (idx, task) in tasks.into_iter().enumerate() {
            let inner = self.inner.clone();
            set.spawn(async move { (idx, run_task(inner, task).await) });
        }

        let mut slots: Vec<Option<AgentResult>> = vec![None; ids.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, r)) => slots[idx] = Some(r),
                Err(e) => tracing::error!(error = %e, "sub-agent task aborted"),
            }
        }

        // panic 的任务拿不到下标，按缺失补一条失败结果
        let results: Vec<AgentResult> = ids
            .into_iter()
            .zip(slots)
            .map(|(id, r)| r.unwrap_or_else(|| AgentResult::failed(id, "task aborted", 0)))
            .collect();
        let ok = results.iter().filter(|r| r.success).count();
        tracing::info!(total = results.len(), ok, "sub-agents finished");
        results
    }
}

async fn run_task(inner: Arc<DispatcherInner>, task: AgentTask) -> AgentResult {
    let Some(profile) = inner.profiles.get(&task.agent_type).cloned() else {
        tracing::warn!(task_id = %task.id, agent_type = %task.agent_type, "unknown agent type");
        return AgentResult::failed(task.id, format!("unknown agent type: {}", task.agent_type), 0);
    };

    // 超时从拿到执行槽位开始计
    let _permit = match &inner.slots {
        Some(sem) => match sem.clone().acquire_owned().await {
            Ok(p) => Some(p),
            Err(e) => return AgentResult::failed(task.id, format!("semaphore closed: {}", e), 0),
        },
        None => None,
    };

    let start = Instant::now();
    let gateway = match &profile.allowed_tools {
        Some(names) => inner.gateway.restricted(names),
        None => inner.gateway.clone(),
    };
    let config = LoopConfig {
        max_iterations: inner.max_iterations,
        streaming: false,
        terminal_tool: inner.terminal_tool.clone(),
        ..LoopConfig::default()
    };
    let worker = TurnLoop::new(inner.llm.clone(), Arc::new(gateway), config)
        .with_retry(inner.retry);
    let cancel = CancellationToken::new();
    tracing::info!(task_id = %task.id, agent_type = %profile.name, "sub-agent started");

    let prompt = task.prompt();
    let run = worker.run(
        Conversation::with_system(profile.system_prompt.clone()),
        &prompt,
        cancel.clone(),
    );
    let outcome = tokio::time::timeout(inner.task_timeout, run).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Err(_) => {
            cancel.cancel();
            tracing::warn!(task_id = %task.id, elapsed_ms, "sub-agent timed out");
            AgentResult::failed(task.id, "timed out", elapsed_ms)
        }
        Ok(Err(e)) => {
            tracing::warn!(task_id = %task.id, error = %e, "sub-agent failed");
            AgentResult::failed(task.id, e.to_string(), elapsed_ms)
        }
        Ok(Ok(r)) => match r.outcome {
            LoopOutcome::Done | LoopOutcome::IterationLimitReached => {
                tracing::info!(task_id = %task.id, elapsed_ms, iterations = r.iterations, "sub-agent done");
                AgentResult::ok(task.id, r.response, elapsed_ms)
            }
            LoopOutcome::Cancelled => AgentResult::failed(task.id, "cancelled", elapsed_ms),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ModelTurn, ScriptedLlmClient};
    use crate::tools::{EchoTool, ToolRegistry};

    fn gateway() -> ToolGateway {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        ToolGateway::new(reg, 5)
    }

    #[tokio::test]
    async fn test_unknown_agent_type_fails_only_that_task() {
        let llm = Arc::new(ScriptedLlmClient::from_turns(vec![]).with_fallback("ok"));
        let d = AgentDispatcher::new(llm, gateway(), Duration::from_secs(5));
        let tasks = vec![
            AgentTask::new("a", "general").with_id("1"),
            AgentTask::new("b", "wizard").with_id("2"),
        ];
        let results = d.dispatch_all(tasks).await;
        assert_eq!(results.len(), 2);
        let by_id: HashMap<_, _> = results.iter().map(|r| (r.id.as_str(), r)).collect();
        assert!(by_id["1"].success);
        assert_eq!(by_id["1"].content, "ok");
        assert!(!by_id["2"].success);
        assert!(by_id["2"].error.as_deref().unwrap().contains("wizard"));
    }

    #[tokio::test]
    async fn test_fatal_provider_error_is_per_task() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Err(LlmError::Auth("bad key".into()))]));
        let d = AgentDispatcher::new(llm, gateway(), Duration::from_secs(5));
        let results = d.dispatch_all(vec![AgentTask::new("a", "general")]).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("bad key"));
    }

    #[tokio::test]
    async fn test_context_is_appended_to_prompt() {
        let llm = Arc::new(ScriptedLlmClient::from_turns(vec![ModelTurn::text("done")]));
        let d = AgentDispatcher::new(llm.clone(), gateway(), Duration::from_secs(5));
        d.dispatch_all(vec![AgentTask::new("summarise", "analyst").with_context("file a.txt")])
            .await;
        let req = &llm.requests()[0];
        let user = req.messages.last().unwrap();
        assert!(user.content.contains("summarise"));
        assert!(user.content.contains("file a.txt"));
        // analyst 只允许只读文件工具，echo 不在其中
        assert!(!req.tools.contains(&"echo".to_string()));
    }

    #[test]
    fn test_batch_timeout_counts_waves() {
        let llm = Arc::new(ScriptedLlmClient::from_turns(vec![]));
        let open = AgentDispatcher::new(llm.clone(), gateway(), Duration::from_secs(10));
        assert_eq!(open.batch_timeout(7), Duration::from_secs(10));
        let capped = AgentDispatcher::new(llm, gateway(), Duration::from_secs(10)).with_max_concurrency(3);
        assert_eq!(capped.batch_timeout(0), Duration::from_secs(10));
        assert_eq!(capped.batch_timeout(3), Duration::from_secs(10));
        assert_eq!(capped.batch_timeout(7), Duration::from_secs(30));
    }

    #[test]
    fn test_task_serde_uses_agent_type_key() {
        let t: AgentTask = serde_json::from_value(serde_json::json!({
            "id": "x", "task": "t", "agentType": "coder"
        }))
        .unwrap();
        assert_eq!(t.agent_type, "coder");
        assert!(t.context.is_none());
    }
}
