//! # gateway-backends
//!
//! Backend integrations for the chat gateway.
//!
//! ## Backends
//!
//! - **OpenAI-compatible**: hosted APIs and local servers (LM Studio, vLLM)
//!   through the same `/v1/chat/completions` streaming protocol
//! - **HTTP tool transport**: remote tool servers exposing a tool listing
//!   and per-tool invocation endpoints
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gateway_backends::OpenAiCompatBackend;
//!
//! let backend = OpenAiCompatBackend::local()?;
//! let client = ChatClient::new(Arc::new(backend), registry, transport, config);
//! ```

pub mod openai_compat;
pub mod tool_http;
pub mod wake;

pub use openai_compat::{OpenAiCompatBackend, OpenAiCompatConfig};
pub use tool_http::HttpToolTransport;
pub use wake::wake_tool_backend;

// Re-export core types for convenience
pub use gateway_core::{
    ChatBackend, ChatClient, ChatConfig, GatewayError, Message, Result, Role, ToolDescriptor,
    ToolRegistry, ToolTransport,
};
