//! 取消控制器
//!
//! 面向用户的「停止当前请求」入口。每个顶层请求开始时 `reset()` 换一个新的 CancellationToken
//! 并把它交给该请求的 TurnLoop，所以旧请求的取消状态不会泄漏到新请求；
//! `request()` 只取消当前 token。取消是协作式的：循环在检查点读取 token，已开始的工具会执行完。

use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// 进程级取消控制器（当前只有一个活跃的顶层请求）
#[derive(Debug, Default)]
pub struct CancellationController {
    current: Mutex<CancellationToken>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 请求取消当前请求
    pub fn request(&self) {
        tracing::info!("cancellation requested");
        self.lock().cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.lock().is_cancelled()
    }

    /// 开始新的顶层请求：丢弃旧 token，返回新请求专属的 token
    pub fn reset(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        *self.lock() = fresh.clone();
        fresh
    }

    /// 当前请求的 token（未 reset 过时为初始 token）
    pub fn token(&self) -> CancellationToken {
        self.lock().clone()
    }

    /// 安装 Ctrl+C 处理：每次 Ctrl+C 取消当前请求（不退出进程）
    pub fn install_ctrl_c(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling current request...");
                controller.request();
            }
        });
    }
}
