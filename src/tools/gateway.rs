//! 工具网关
//!
//! 持有 ToolRegistry 与单次调用超时，`execute(name, args)` 永不返回错误：
//! 未知工具、参数错误、工具失败、panic 与超时都归一化为 `ToolResult { success: false }`；
//! 每次调用输出一条结构化审计日志（JSON）。网关本身无共享可变状态，并发调用互不影响。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::time::timeout;

use crate::tools::{ToolArgs, ToolRegistry, ToolResult, ToolSpec};

/// 工具网关：按名分发到具体工具，施加超时并归一化结果
#[derive(Clone)]
pub struct ToolGateway {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolGateway {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::with_timeout(registry, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 执行指定工具；未注册的名称直接失败且不触发任何副作用
    pub async fn execute(&self, tool_name: &str, args: ToolArgs) -> ToolResult {
        let Some(tool) = self.registry.get(tool_name) else {
            tracing::warn!(tool = %tool_name, "unknown tool requested");
            return ToolResult::failure(format!("Unknown tool: {}", tool_name));
        };

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let limit = tool.timeout(&args).unwrap_or(self.timeout);
        let result = timeout(limit, AssertUnwindSafe(tool.execute(args)).catch_unwind()).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(Ok(r))) if r.success => (true, "ok"),
            Ok(Ok(Ok(_))) => (false, "failed"),
            Ok(Ok(Err(_))) => (false, "error"),
            Ok(Err(_)) => (false, "panic"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(Ok(r))) => r,
            Ok(Ok(Err(e))) => ToolResult::from(e),
            Ok(Err(payload)) => {
                let msg = panic_message(payload.as_ref());
                tracing::error!(tool = %tool_name, panic = %msg, "tool panicked");
                ToolResult::failure(format!("tool panicked: {}", msg))
            }
            Err(_) => ToolResult::failure(format!(
                "tool timed out after {}s",
                limit.as_secs_f64()
            )),
        }
    }

    /// listTools：发给 Provider 的工具描述
    pub fn list_tools(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 构造只含给定工具的子网关（同一超时）
    pub fn restricted(&self, names: &[String]) -> Self {
        Self {
            registry: self.registry.subset(names),
            timeout: self.timeout,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn args_preview(args: &ToolArgs) -> String {
    let s = args.as_value().to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
