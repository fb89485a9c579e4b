//! AgentDispatcher 集成测试：逐任务超时、完整性、并发与限流

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use swarm::dispatch::{AgentDispatcher, AgentTask};
use swarm::llm::{LlmClient, LlmError, ModelTurn};
use swarm::memory::{Message, Role};
use swarm::tools::{EchoTool, ToolGateway, ToolRegistry, ToolSpec};

/// 按任务内容决定耗时：`sleep:<secs>` 前缀的任务先睡眠再回复
struct TimedLlm;

#[async_trait]
impl LlmClient for TimedLlm {
    async fn send_turn(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<ModelTurn, LlmError> {
        let task = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if let Some(secs) = task
            .strip_prefix("sleep:")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse::<u64>().ok())
        {
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
        Ok(ModelTurn::text(format!("done: {}", task)))
    }
}

/// 睡 5 秒后才记一次完成
struct FinishCountingLlm {
    finished: Arc<AtomicUsize>,
}

#[async_trait]
impl LlmClient for FinishCountingLlm {
    async fn send_turn(
        &self,
        _messages: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<ModelTurn, LlmError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(ModelTurn::text("finished"))
    }
}

fn dispatcher(timeout_secs: u64) -> AgentDispatcher {
    let mut reg = ToolRegistry::new();
    reg.register(EchoTool);
    AgentDispatcher::new(
        Arc::new(TimedLlm),
        ToolGateway::new(reg, 5),
        Duration::from_secs(timeout_secs),
    )
}

#[tokio::test(start_paused = true)]
async fn test_one_task_times_out_others_complete() {
    let d = dispatcher(10);
    let tasks = vec![
        AgentTask::new("sleep:1 first", "general").with_id("t1"),
        AgentTask::new("sleep:3600 second", "general").with_id("t2"),
        AgentTask::new("third", "analyst").with_id("t3"),
    ];

    let results = d.dispatch_all(tasks).await;

    assert_eq!(results.len(), 3);
    let get = |id: &str| results.iter().find(|r| r.id == id).unwrap();
    assert!(get("t1").success);
    assert_eq!(get("t1").content, "done: sleep:1 first");
    assert!(!get("t2").success);
    assert_eq!(get("t2").error.as_deref(), Some("timed out"));
    assert!(get("t3").success);
}

#[tokio::test]
async fn test_every_task_gets_exactly_one_result() {
    let d = dispatcher(30);
    let tasks: Vec<AgentTask> = (0..12)
        .map(|i| {
            let kind = if i % 4 == 0 { "unknown" } else { "general" };
            AgentTask::new(format!("task {}", i), kind)
        })
        .collect();
    let ids: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();

    let results = d.dispatch_all(tasks).await;

    assert_eq!(results.len(), 12);
    let got: HashSet<String> = results.iter().map(|r| r.id.clone()).collect();
    assert_eq!(got, ids);
    assert_eq!(results.iter().filter(|r| !r.success).count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_tasks_run_concurrently() {
    let d = dispatcher(60);
    let tasks = (0..3)
        .map(|i| AgentTask::new(format!("sleep:5 job {}", i), "general"))
        .collect();

    let start = tokio::time::Instant::now();
    let results = d.dispatch_all(tasks).await;

    assert!(results.iter().all(|r| r.success));
    assert!(start.elapsed() < Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_starts_after_slot_is_acquired() {
    // 两个任务各 5 秒，槽位 1：第二个任务排队 5 秒，但超时 8 秒从拿到槽位开始计
    let d = dispatcher(8).with_max_concurrency(1);
    let tasks = vec![
        AgentTask::new("sleep:5 a", "general"),
        AgentTask::new("sleep:5 b", "general"),
    ];

    let start = tokio::time::Instant::now();
    let results = d.dispatch_all(tasks).await;

    assert!(results.iter().all(|r| r.success), "{:?}", results);
    assert!(start.elapsed() >= Duration::from_secs(10));
}

#[tokio::test]
async fn test_empty_task_list() {
    let d = dispatcher(5);
    assert!(d.dispatch_all(Vec::new()).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_batch_needing_several_waves() {
    // 5 个任务、槽位 2：分 3 轮，每个任务仍在自己的超时内完成
    let d = dispatcher(8).with_max_concurrency(2);
    assert_eq!(d.batch_timeout(5), Duration::from_secs(24));
    let tasks = (0..5)
        .map(|i| AgentTask::new(format!("sleep:5 job {}", i), "general"))
        .collect();

    let start = tokio::time::Instant::now();
    let results = tokio::time::timeout(d.batch_timeout(5), d.dispatch_all(tasks))
        .await
        .expect("batch finishes within its batch timeout");

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.success), "{:?}", results);
    assert!(start.elapsed() >= Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_dispatch_stops_its_workers() {
    let finished = Arc::new(AtomicUsize::new(0));
    let d = AgentDispatcher::new(
        Arc::new(FinishCountingLlm {
            finished: finished.clone(),
        }),
        ToolGateway::new(ToolRegistry::new(), 5),
        Duration::from_secs(60),
    );
    let tasks = vec![
        AgentTask::new("a", "general"),
        AgentTask::new("b", "general"),
    ];

    let dropped = tokio::time::timeout(Duration::from_secs(1), d.dispatch_all(tasks)).await;
    assert!(dropped.is_err());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}
