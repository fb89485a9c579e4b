//! 子智能体调度：把一组独立子任务并发交给 worker Provider 执行，逐任务超时、故障隔离并汇总结果

pub mod dispatcher;
pub mod profile;

pub use dispatcher::{AgentDispatcher, AgentResult, AgentTask};
pub use profile::{builtin_profiles, AgentProfile};
