//! # gateway-core
//!
//! Conversation orchestration core with backend-agnostic streaming chat and
//! remote tool dispatch.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ChatClient                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────┐  │
//! │  │    Stream    │  │  Tool Call   │  │    ChatBackend    │  │
//! │  │   Decoder    │──│  Dispatcher  │──│    (Strategy)     │  │
//! │  └──────────────┘  └──────────────┘  └───────────────────┘  │
//! │  ┌──────────────┐  ┌──────────────┐                         │
//! │  │    Stream    │  │     Rate     │                         │
//! │  │  Lifecycle   │  │   Limiter    │                         │
//! │  └──────────────┘  └──────────────┘                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `ChatBackend` trait enables swapping between hosted and local
//! OpenAI-compatible endpoints without changing orchestration logic.

pub mod backend;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod orchestrator;
pub mod ratelimit;
pub mod validate;

pub use backend::{ChatBackend, ChatRequest, DeltaStream, FinishReason, StreamDelta, ToolCallDelta, ToolDescriptor};
pub use decoder::{DecodeOutcome, StreamDecoder};
pub use dispatch::{SharedToolRegistry, ToolCallDispatcher, ToolCallRequest, ToolContent, ToolRegistry, ToolTransport};
pub use error::{GatewayError, Result};
pub use lifecycle::{Closable, SessionState, SharedStreamSession, StreamLifecycleManager, StreamSession};
pub use message::{ContentPart, Conversation, Message, Role, ToolCallRecord};
pub use orchestrator::{ChatClient, ChatConfig, TurnOutcome, DEFAULT_SYSTEM_PROMPT};
pub use ratelimit::RateLimiter;
pub use validate::InputValidator;
