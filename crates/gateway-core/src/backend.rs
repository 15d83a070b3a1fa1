//! Chat Backend Strategy
//!
//! Defines a common interface for streaming chat backends (hosted or local
//! OpenAI-compatible endpoints) so the orchestration core works identically
//! regardless of which backend the user selected.
//!
//! Backends emit RAW deltas: a tool call arrives as fragments spread across
//! many chunks, each tagged with the provider's parallel-call index. Putting
//! the fragments back together is the decoder's job, not the backend's.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;

/// Descriptor of one remote tool, as advertised by its backend connection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments
    pub parameters: serde_json::Value,
}

/// A request for one streaming model turn
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Tool descriptors to advertise; empty = no tools parameter sent
    pub tools: Vec<ToolDescriptor>,
    pub temperature: f32,
}

/// One fragment of a streamed tool call.
///
/// `index` is the position in the provider's parallel tool-call array and is
/// the only stable key: id/name/arguments may each arrive in any chunk, split
/// at arbitrary byte boundaries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Terminal signal on a delta
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Normal end of the assistant turn
    Stop,
    /// All tool-call fragments have been emitted
    ToolCalls,
}

/// An incremental fragment of a streaming model response
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Assistant text increment
    #[serde(default)]
    pub content: Option<String>,

    /// Tool-call fragments carried by this delta
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,

    /// Terminal signal, present on the last meaningful delta
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

impl StreamDelta {
    /// A delta carrying nothing the decoder cares about
    pub fn is_empty(&self) -> bool {
        self.content.as_deref().is_none_or(str::is_empty)
            && self.tool_calls.is_empty()
            && self.finish_reason.is_none()
    }
}

/// Stream type for model response deltas
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// Strategy trait for streaming chat backends.
///
/// Implement this to add a new model endpoint. The orchestrator works
/// exclusively through this interface; backend selection is configuration.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend name for logging and the UI toggle
    fn name(&self) -> &str;

    /// Check if the backend is reachable and configured correctly
    async fn health_check(&self) -> Result<bool>;

    /// Open a streaming chat completion.
    ///
    /// Must return `GatewayError::ToolsUnsupported` when the endpoint
    /// rejects the tools parameter, so the orchestrator can retry without it.
    async fn stream_chat(&self, request: ChatRequest) -> Result<DeltaStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_delta() {
        let delta = StreamDelta::default();
        assert!(delta.is_empty());

        let delta = StreamDelta { content: Some(String::new()), ..Default::default() };
        assert!(delta.is_empty());

        let delta = StreamDelta { content: Some("hi".into()), ..Default::default() };
        assert!(!delta.is_empty());
    }

    #[test]
    fn test_delta_deserializes_provider_shape() {
        let data = r#"{"content":null,"tool_calls":[{"index":0,"id":"call_a","name":"search","arguments":"{\"loc\""}],"finish_reason":null}"#;
        let delta: StreamDelta = serde_json::from_str(data).unwrap();
        assert_eq!(delta.tool_calls.len(), 1);
        assert_eq!(delta.tool_calls[0].index, 0);
        assert_eq!(delta.tool_calls[0].arguments.as_deref(), Some("{\"loc\""));
    }
}
