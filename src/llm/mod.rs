//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock），以及按配置创建 Provider

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::{MockLlmClient, RecordedRequest, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{collect_turn, LlmClient, LlmError, ModelTurn, TurnChunk, TurnStream};

use crate::config::ProviderSection;

/// 根据 [llm.primary] / [llm.worker] 段创建 Provider；provider 为 mock 或缺少 API Key 时回退到 Mock
pub fn create_llm_from_config(role: &str, section: &ProviderSection) -> Arc<dyn LlmClient> {
    let provider = section.provider.to_lowercase();
    let api_key = std::env::var(&section.api_key_env).ok();
    if provider == "openai" {
        match api_key {
            Some(key) => {
                match OpenAiClient::new(
                    section.base_url.as_deref(),
                    &section.model,
                    Some(&key),
                    section.request_timeout_secs,
                ) {
                    Ok(client) => {
                        tracing::info!(role, model = %section.model, "Using OpenAI-compatible LLM");
                        return Arc::new(client);
                    }
                    Err(e) => tracing::warn!(role, error = %e, "OpenAI client init failed"),
                }
            }
            None => tracing::warn!(
                role,
                env = %section.api_key_env,
                "API key env not set"
            ),
        }
    } else if provider != "mock" {
        tracing::warn!(role, provider = %provider, "Unknown provider");
    }
    tracing::warn!(role, "Using Mock LLM");
    Arc::new(MockLlmClient)
}
