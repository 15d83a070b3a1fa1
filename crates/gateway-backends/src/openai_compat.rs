//! OpenAI-Compatible Chat Backend
//!
//! Implementation of `ChatBackend` for any `/v1/chat/completions` endpoint:
//! hosted APIs as well as local servers (LM Studio, vLLM, llama.cpp).
//!
//! Deltas are forwarded RAW: tool-call fragments pass through exactly as the
//! provider chunked them, tagged with their parallel-call index. Reassembly
//! happens downstream in the decoder.

use async_trait::async_trait;
use futures::StreamExt;
use gateway_core::backend::{
    ChatBackend, ChatRequest, DeltaStream, FinishReason, StreamDelta, ToolCallDelta,
    ToolDescriptor,
};
use gateway_core::error::{GatewayError, Result};
use gateway_core::message::Message;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

/// OpenAI-compatible backend configuration
#[derive(Clone, Debug)]
pub struct OpenAiCompatConfig {
    /// Display name, surfaced in logs and the backend toggle
    pub name: String,

    /// Base URL up to and including `/v1`
    pub base_url: String,

    /// Bearer token; local servers accept any placeholder
    pub api_key: String,

    /// Connection timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            name: "local".into(),
            base_url: "http://localhost:1234/v1".into(),
            api_key: "not-needed".into(),
            timeout_secs: 120,
        }
    }
}

impl OpenAiCompatConfig {
    /// Hosted endpoint settings from `CHAT_API_BASE` / `CHAT_API_KEY`
    pub fn hosted_from_env() -> Result<Self> {
        let base_url = std::env::var("CHAT_API_BASE")
            .map_err(|_| GatewayError::Config("CHAT_API_BASE is not set".into()))?;
        let api_key = std::env::var("CHAT_API_KEY")
            .map_err(|_| GatewayError::Config("CHAT_API_KEY is not set".into()))?;

        Ok(Self {
            name: "hosted".into(),
            base_url,
            api_key,
            ..Default::default()
        })
    }

    /// Local endpoint settings, honoring `LOCAL_API_BASE` if set
    pub fn local_from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base_url) = std::env::var("LOCAL_API_BASE") {
            config.base_url = base_url;
        }
        config
    }
}

/// Streaming chat backend for OpenAI-compatible endpoints
pub struct OpenAiCompatBackend {
    config: OpenAiCompatConfig,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    pub fn from_config(config: OpenAiCompatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            config: OpenAiCompatConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            client,
        })
    }

    /// Hosted backend from environment variables
    pub fn hosted() -> Result<Self> {
        Self::from_config(OpenAiCompatConfig::hosted_from_env()?)
    }

    /// Local backend (LM Studio conventions) from environment variables
    pub fn local() -> Result<Self> {
        Self::from_config(OpenAiCompatConfig::local_from_env())
    }

    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.to_string(),
                content: Some(m.content.clone()),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    fn to_api_tools(tools: &[ToolDescriptor]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.config.base_url);
        match self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await
        {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                warn!(backend = %self.config.name, error = %e, "Health check failed");
                Ok(false)
            }
        }
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<DeltaStream> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let tools_sent = !request.tools.is_empty();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": true,
        });

        if tools_sent {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        debug!(backend = %self.config.name, model = %request.model, tools = request.tools.len(), "Opening chat stream");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    GatewayError::BackendUnavailable(e.to_string())
                } else {
                    GatewayError::Backend(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            // A 4xx complaining about tools means function calling is off for
            // this model; surface the typed variant so the orchestrator can
            // retry without tools. The string inspection stays at this
            // boundary only.
            if tools_sent && status.is_client_error() && mentions_tools(&error_body) {
                return Err(GatewayError::ToolsUnsupported(error_body));
            }
            warn!(status = status.as_u16(), body = %error_body, "Backend rejected chat request");
            return Err(GatewayError::Backend(format!(
                "HTTP {}: {}",
                status.as_u16(),
                error_body
            )));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<StreamDelta>>(64);
        let backend_name = self.config.name.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(GatewayError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    match parse_sse_line(&line) {
                        SseEvent::Ignore => {}
                        SseEvent::Done => return,
                        SseEvent::Delta(delta) => {
                            if tx.send(Ok(delta)).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                        SseEvent::Unparseable(data, e) => {
                            trace!(
                                backend = %backend_name,
                                data = %data,
                                error = %e,
                                "Ignoring unparseable SSE chunk"
                            );
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn mentions_tools(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("tool") || lower.contains("function calling") || lower.contains("functions")
}

/// Outcome of parsing one SSE line
enum SseEvent {
    /// Blank line, comment, or non-data field
    Ignore,
    /// `data: [DONE]`
    Done,
    Delta(StreamDelta),
    Unparseable(String, serde_json::Error),
}

/// Parse one line of an SSE chat-completions stream into a raw delta
fn parse_sse_line(line: &str) -> SseEvent {
    if line.is_empty() || line.starts_with(':') {
        return SseEvent::Ignore;
    }
    let Some(data) = line.strip_prefix("data: ") else {
        return SseEvent::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }

    match serde_json::from_str::<WireChunk>(data) {
        Ok(chunk) => match chunk.choices.into_iter().next() {
            Some(choice) => SseEvent::Delta(convert_choice(choice)),
            None => SseEvent::Ignore,
        },
        Err(e) => SseEvent::Unparseable(data.to_string(), e),
    }
}

fn convert_choice(choice: WireChoice) -> StreamDelta {
    let tool_calls = choice
        .delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments),
                None => (None, None),
            };
            ToolCallDelta { index: tc.index, id: tc.id, name, arguments }
        })
        .collect();

    let finish_reason = choice.finish_reason.as_deref().map(|reason| match reason {
        "tool_calls" => FinishReason::ToolCalls,
        "stop" => FinishReason::Stop,
        other => {
            // "length", "content_filter", etc. still terminate the turn
            warn!(reason = other, "Unusual finish reason; treating as stop");
            FinishReason::Stop
        }
    });

    StreamDelta {
        content: choice.delta.content,
        tool_calls,
        finish_reason,
    }
}

// --- Wire types (OpenAI chat-completions SSE) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

/// A single SSE `data: {...}` chunk from a streaming response
#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

/// A tool call delta: arrives incrementally across chunks
#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_delta(line: &str) -> StreamDelta {
        match parse_sse_line(line) {
            SseEvent::Delta(d) => d,
            _ => panic!("expected a delta from {line:?}"),
        }
    }

    #[test]
    fn test_parse_content_delta() {
        let delta = parse_delta(
            r#"data: {"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#,
        );
        assert_eq!(delta.content.as_deref(), Some("Hello"));
        assert!(delta.tool_calls.is_empty());
        assert!(delta.finish_reason.is_none());
    }

    #[test]
    fn test_parse_finish_chunk() {
        let delta =
            parse_delta(r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        assert_eq!(delta.finish_reason, Some(FinishReason::ToolCalls));

        let delta = parse_delta(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        assert_eq!(delta.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_parse_tool_call_fragment_passes_through_raw() {
        let delta = parse_delta(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"search_properties","arguments":"{\"loc"}}]},"finish_reason":null}]}"#,
        );
        assert_eq!(delta.tool_calls.len(), 1);
        let tc = &delta.tool_calls[0];
        assert_eq!(tc.index, 0);
        assert_eq!(tc.id.as_deref(), Some("call_a"));
        assert_eq!(tc.name.as_deref(), Some("search_properties"));
        // Partial JSON stays partial; no reassembly here
        assert_eq!(tc.arguments.as_deref(), Some("{\"loc"));
    }

    #[test]
    fn test_parse_arguments_only_fragment() {
        let delta = parse_delta(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"ation\":\"NYC\"}"}}]},"finish_reason":null}]}"#,
        );
        let tc = &delta.tool_calls[0];
        assert_eq!(tc.index, 1);
        assert!(tc.id.is_none());
        assert!(tc.name.is_none());
        assert_eq!(tc.arguments.as_deref(), Some("ation\":\"NYC\"}"));
    }

    #[test]
    fn test_parse_done_and_noise() {
        assert!(matches!(parse_sse_line("data: [DONE]"), SseEvent::Done));
        assert!(matches!(parse_sse_line(""), SseEvent::Ignore));
        assert!(matches!(parse_sse_line(": keep-alive"), SseEvent::Ignore));
        assert!(matches!(parse_sse_line("event: ping"), SseEvent::Ignore));
        assert!(matches!(
            parse_sse_line("data: {not json"),
            SseEvent::Unparseable(_, _)
        ));
    }

    #[test]
    fn test_unknown_finish_reason_treated_as_stop() {
        let delta = parse_delta(r#"data: {"choices":[{"delta":{},"finish_reason":"length"}]}"#);
        assert_eq!(delta.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_mentions_tools() {
        assert!(mentions_tools("Function calling is not enabled for this model"));
        assert!(mentions_tools(r#"{"error":"'tools' is not supported"}"#));
        assert!(!mentions_tools("internal server error"));
    }

    #[test]
    fn test_message_conversion_with_tool_calls() {
        use gateway_core::message::ToolCallRecord;

        let mut history = vec![gateway_core::Message::user("find homes")];
        history.push(gateway_core::Message::assistant_tool_call(ToolCallRecord {
            id: "call_1".into(),
            name: "search_properties".into(),
            arguments: r#"{"location":"NYC"}"#.into(),
        }));

        let api = OpenAiCompatBackend::to_api_messages(&history);
        assert_eq!(api[0].role, "user");
        assert_eq!(api[1].role, "assistant");
        let calls = api[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "search_properties");
        assert_eq!(calls[0].function.arguments, r#"{"location":"NYC"}"#);
    }

    #[test]
    fn test_config_defaults() {
        let config = OpenAiCompatConfig::default();
        assert_eq!(config.base_url, "http://localhost:1234/v1");
        assert_eq!(config.name, "local");
    }
}
