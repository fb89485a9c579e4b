//! 核心层：错误类型、Provider 重试策略、取消控制

pub mod cancel;
pub mod error;
pub mod retry;

pub use cancel::CancellationController;
pub use error::AgentError;
pub use retry::{
    is_retryable_status, is_transient_message, with_retry, IsRetryable, RetryPolicy,
};
