//! OpenAI 兼容 API 客户端
//!
//! 直接以 reqwest 调用任意 OpenAI 兼容端点的 `/chat/completions`（可配置 base_url；DeepSeek、OpenAI、自建代理等），
//! 使用原生 function calling 传递工具；HTTP 状态码映射为 LlmError，供重试策略区分限流 / 5xx / 致命错误。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::{LlmClient, LlmError, ModelTurn};
use crate::memory::{Message, Role};
use crate::tools::{ToolArgs, ToolInvocation, ToolSpec};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        request_timeout_secs: u64,
    ) -> Result<Self, LlmError> {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs.max(1)))
            .build()
            .map_err(|e| LlmError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            api_key,
            usage: TokenUsage::new(),
        })
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolSpec]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(to_wire_message).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

fn to_wire_message(m: &Message) -> Value {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut wire = json!({ "role": role, "content": m.content });
    if let Some(id) = &m.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    if !m.tool_calls.is_empty() {
        wire["tool_calls"] = Value::Array(
            m.tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.args.as_value().to_string(),
                        }
                    })
                })
                .collect(),
        );
    }
    wire
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// 把响应转为 ModelTurn；单个调用的 arguments 不是合法 JSON 对象时只丢弃该调用
fn parse_turn(resp: ChatResponse) -> Result<ModelTurn, LlmError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::MalformedResponse("no choices in response".to_string()))?;
    let mut calls = Vec::new();
    for tc in choice.message.tool_calls {
        let raw = if tc.function.arguments.trim().is_empty() {
            "{}"
        } else {
            tc.function.arguments.as_str()
        };
        let args = serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(ToolArgs::from_value);
        match args {
            Some(args) => {
                let call = if tc.id.is_empty() {
                    ToolInvocation::with_derived_id(tc.function.name, args)
                } else {
                    ToolInvocation::new(tc.id, tc.function.name, args)
                };
                calls.push(call);
            }
            None => tracing::warn!(
                tool = %tc.function.name,
                arguments = %tc.function.arguments,
                "dropping structured call with malformed arguments"
            ),
        }
    }
    Ok(ModelTurn::with_calls(
        choice.message.content.unwrap_or_default(),
        calls,
    ))
}

/// HTTP 状态码 → LlmError
pub(crate) fn error_from_status(status: u16, retry_after: Option<u64>, body: String) -> LlmError {
    match status {
        429 => LlmError::RateLimited {
            retry_after_ms: retry_after.map(|s| s * 1000),
        },
        401 | 403 => LlmError::Auth(body),
        400 | 404 | 422 => LlmError::InvalidRequest(body),
        _ => LlmError::Http {
            status,
            message: body,
        },
    }
}

fn error_from_transport(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else if e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        // bytes() 把读取响应体时的中断包装为 decode 错误；JSON 解析不经过这里
        LlmError::Network(e.to_string())
    } else {
        LlmError::Other(e.to_string())
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn send_turn(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelTurn, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(messages, tools))
            .send()
            .await
            .map_err(error_from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_status(status.as_u16(), retry_after, body));
        }

        // 先完整读取响应体：传输中断属于网络错误（可重试），读完后无法解析才是格式错误
        let body = response.bytes().await.map_err(error_from_transport)?;
        let parsed: ChatResponse = serde_json::from_slice(&body)
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        if let Some(usage) = &parsed.usage {
            self.usage.add(usage.prompt_tokens, usage.completion_tokens);
        }
        parse_turn(parsed)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::core::IsRetryable;

    /// 本地一次性 HTTP 服务：读完请求后原样写回 `raw` 并关闭连接
    async fn serve_once(raw: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            sock.write_all(raw.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: &str) -> OpenAiClient {
        OpenAiClient::new(Some(base_url), "test-model", Some("k"), 5).unwrap()
    }

    #[tokio::test]
    async fn test_truncated_body_is_retryable_network_error() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"choices\": [",
        )
        .await;
        let err = client(&url)
            .send_turn(&[Message::user("hi")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Network(_)), "{:?}", err);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_complete_non_json_body_is_malformed() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot json!",
        )
        .await;
        let err = client(&url)
            .send_turn(&[Message::user("hi")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)), "{:?}", err);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_successful_response_parses() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 95\r\nConnection: close\r\n\r\n{\"choices\":[{\"message\":{\"content\":\"hello\"}}],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":1}}",
        )
        .await;
        let c = client(&url);
        let turn = c.send_turn(&[Message::user("hi")], &[]).await.unwrap();
        assert_eq!(turn.text, "hello");
        assert_eq!(c.token_usage(), (2, 1, 3));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            error_from_status(429, Some(2), String::new()),
            LlmError::RateLimited {
                retry_after_ms: Some(2000)
            }
        );
        assert!(matches!(
            error_from_status(401, None, String::new()),
            LlmError::Auth(_)
        ));
        assert!(matches!(
            error_from_status(400, None, String::new()),
            LlmError::InvalidRequest(_)
        ));
        assert!(matches!(
            error_from_status(503, None, String::new()),
            LlmError::Http { status: 503, .. }
        ));
    }

    #[test]
    fn test_parse_turn_drops_malformed_call_only() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "a", "type": "function", "function": {"name": "echo", "arguments": "{\"text\":\"hi\"}"}},
                        {"id": "b", "type": "function", "function": {"name": "echo", "arguments": "{broken"}},
                        {"id": "", "type": "function", "function": {"name": "list_dir", "arguments": ""}}
                    ]
                }
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4}
        }))
        .unwrap();
        let turn = parse_turn(resp).unwrap();
        assert_eq!(turn.text, "");
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].id, "a");
        assert_eq!(turn.tool_calls[0].args.get_str("text"), Some("hi"));
        assert_eq!(turn.tool_calls[1].name, "list_dir");
        assert!(turn.tool_calls[1].id.starts_with("call_"));
    }

    #[test]
    fn test_wire_message_carries_tool_fields() {
        let call = ToolInvocation::new("c1", "echo", ToolArgs::new().with("text", "x"));
        let m = Message::assistant_with_calls("", vec![call]);
        let wire = to_wire_message(&m);
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "echo");

        let t = Message::tool("c1", "out");
        let wire = to_wire_message(&t);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c1");
    }

    #[test]
    fn test_no_choices_is_malformed() {
        let resp = ChatResponse {
            choices: vec![],
            usage: None,
        };
        assert!(matches!(parse_turn(resp), Err(LlmError::MalformedResponse(_))));
    }
}
