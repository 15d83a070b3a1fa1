//! Tool Call Dispatch
//!
//! Resolves which remote tool backend owns a called tool name, invokes it
//! through the transport, normalizes the heterogeneous result content, and
//! folds both the call and its result into conversation history. Failures
//! never propagate to the caller: every error becomes a structured text
//! result correlated to the original call id, so the model always sees a
//! tool response.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::ToolDescriptor;
use crate::error::Result;
use crate::message::{ContentPart, Message, ToolCallRecord};
use crate::validate::InputValidator;

/// A finalized tool-call request, ready for dispatch
#[derive(Clone, Debug)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Parsed arguments; always valid JSON by the time dispatch runs
    pub arguments: serde_json::Value,
    /// Raw arguments string as the model produced it, replayed to the
    /// backend on the assistant message
    pub raw_arguments: String,
}

/// One content item returned by a remote tool
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    Image { mime_type: String, data: String },
    /// Anything the transport could not classify; never dropped silently
    Unsupported { kind: String },
}

/// Transport to remote tool backends.
///
/// A connect event elsewhere delivers `(connection_name, descriptors)` into
/// the [`ToolRegistry`]; this trait only covers invocation.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn invoke(
        &self,
        connection: &str,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<Vec<ToolContent>>;
}

/// Mapping from backend connection name to the tools it exposes.
///
/// Built once per connection event, read on every dispatch.
#[derive(Default)]
pub struct ToolRegistry {
    connections: HashMap<String, Vec<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the descriptor list for a connection
    pub fn register_connection(
        &mut self,
        name: impl Into<String>,
        descriptors: Vec<ToolDescriptor>,
    ) {
        let name = name.into();
        tracing::info!(connection = %name, tools = descriptors.len(), "Tool connection registered");
        self.connections.insert(name, descriptors);
    }

    /// Drop a connection and its tools
    pub fn remove_connection(&mut self, name: &str) {
        self.connections.remove(name);
    }

    /// Find the connection owning a tool name; first match wins
    pub fn resolve(&self, tool_name: &str) -> Option<&str> {
        self.connections
            .iter()
            .find(|(_, descriptors)| descriptors.iter().any(|d| d.name == tool_name))
            .map(|(name, _)| name.as_str())
    }

    /// All descriptors across connections, for the model request's tools list
    pub fn all_descriptors(&self) -> Vec<ToolDescriptor> {
        self.connections.values().flatten().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.values().all(Vec::is_empty)
    }
}

/// Shared registry handle: the server's connect handler writes, dispatch reads
pub type SharedToolRegistry = Arc<RwLock<ToolRegistry>>;

/// Executes finalized tool calls and records them in history
pub struct ToolCallDispatcher {
    registry: SharedToolRegistry,
    transport: Arc<dyn ToolTransport>,
    validator: InputValidator,
}

impl ToolCallDispatcher {
    pub fn new(registry: SharedToolRegistry, transport: Arc<dyn ToolTransport>) -> Self {
        Self {
            registry,
            transport,
            validator: InputValidator::new(),
        }
    }

    /// Dispatch one tool call.
    ///
    /// Always appends exactly one assistant message (carrying the call) and
    /// one tool message (carrying the result) to `history`, in that order,
    /// and returns the normalized result parts. Never errors.
    pub async fn dispatch(
        &self,
        history: &mut crate::message::Conversation,
        call: &ToolCallRequest,
    ) -> Vec<ContentPart> {
        tracing::debug!(tool = %call.name, call_id = %call.id, "Dispatching tool call");

        history.push(Message::assistant_tool_call(ToolCallRecord {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.raw_arguments.clone(),
        }));

        let parts = self.invoke_normalized(call).await;
        history.push(Message::tool_result(&call.id, &call.name, parts.clone()));
        parts
    }

    async fn invoke_normalized(&self, call: &ToolCallRequest) -> Vec<ContentPart> {
        // Lock scope kept tight: resolve, then drop the guard before awaiting
        let connection = {
            let registry = self.registry.read().expect("tool registry poisoned");
            registry.resolve(&call.name).map(str::to_owned)
        };

        let Some(connection) = connection else {
            tracing::warn!(tool = %call.name, "No tool backend owns this tool");
            return vec![ContentPart::Text {
                text: format!(
                    "Error: no active connection exposes tool '{}'. Connect the tool server and try again.",
                    call.name
                ),
            }];
        };

        let args = self.validator.sanitize_tool_args(call.arguments.clone());

        match self.transport.invoke(&connection, &call.name, &args).await {
            Ok(items) if items.is_empty() => vec![ContentPart::Text {
                text: "No response received from tool".into(),
            }],
            Ok(items) => items.into_iter().map(normalize_content).collect(),
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool invocation failed");
                vec![ContentPart::Text {
                    text: format!("Error calling tool '{}': {}", call.name, e),
                }]
            }
        }
    }
}

/// Convert one transport content item into a message content part
fn normalize_content(item: ToolContent) -> ContentPart {
    match item {
        ToolContent::Text { text } => ContentPart::Text { text },
        ToolContent::Image { mime_type, data } => ContentPart::ImageUrl {
            url: format!("data:{};base64,{}", mime_type, data),
        },
        ToolContent::Unsupported { kind } => ContentPart::Text {
            text: format!("Unsupported content type: {}", kind),
        },
    }
}
