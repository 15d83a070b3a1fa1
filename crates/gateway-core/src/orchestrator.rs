//! Conversation Orchestration
//!
//! [`ChatClient`] owns one conversation end to end: it validates input,
//! throttles outbound requests, opens model streams, runs the decoder over
//! each one, and loops while the model keeps calling tools. One instance per
//! conversation; no state is shared across conversations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::backend::{ChatBackend, ChatRequest, ToolDescriptor};
use crate::decoder::{DecodeOutcome, StreamDecoder};
use crate::dispatch::{SharedToolRegistry, ToolCallDispatcher, ToolTransport};
use crate::error::{GatewayError, Result};
use crate::lifecycle::{StreamLifecycleManager, StreamSession};
use crate::message::{Conversation, Message};
use crate::ratelimit::RateLimiter;
use crate::validate::InputValidator;

/// Default instructions: a home-finding assistant that knows how to call
/// search tools, including the inline-JSON form for models without native
/// tool calling.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful home finder assistant. Use the available tools to search property listings and answer questions about them.

When you need to use a tool and cannot emit a native tool call, respond with only a JSON object in this exact format:
<tool_call>
{"name": "search_properties", "arguments": {"location": "San Francisco", "max_price": 900000}}
</tool_call>

Summarize tool results for the user in plain language. If no listings match, say so and suggest loosening the criteria."#;

/// Tunables for one conversation
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
    /// Model requests allowed per 60-second window
    pub requests_per_minute: usize,
    /// Hard wall-clock ceiling on decoding one model stream
    pub stream_timeout: Duration,
    /// Cap on model round-trips within a single user turn
    pub max_tool_iterations: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: "qwen2.5-7b-instruct".into(),
            temperature: 0.2,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            requests_per_minute: 20,
            stream_timeout: Duration::from_secs(30),
            max_tool_iterations: 8,
        }
    }
}

/// How one user turn ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model closed the turn normally
    Completed,
    /// The caller stopped consuming text; cleaned up, nothing to report
    Cancelled,
}

/// Orchestrates one conversation against a streaming chat backend.
pub struct ChatClient {
    backend: Arc<dyn ChatBackend>,
    dispatcher: ToolCallDispatcher,
    registry: SharedToolRegistry,
    config: ChatConfig,
    history: Conversation,
    streams: StreamLifecycleManager,
    rate_limiter: RateLimiter,
    validator: InputValidator,
}

impl ChatClient {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        registry: SharedToolRegistry,
        transport: Arc<dyn ToolTransport>,
        config: ChatConfig,
    ) -> Self {
        let history = Conversation::with_system_prompt(&config.system_prompt);
        let rate_limiter = RateLimiter::per_minute(config.requests_per_minute);
        Self {
            backend,
            dispatcher: ToolCallDispatcher::new(registry.clone(), transport),
            registry,
            config,
            history,
            streams: StreamLifecycleManager::new(),
            rate_limiter,
            validator: InputValidator::new(),
        }
    }

    pub fn history(&self) -> &Conversation {
        &self.history
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Streams still registered with the lifecycle manager
    pub fn active_streams(&self) -> usize {
        self.streams.active_count()
    }

    /// Swap the chat backend between turns (UI toggle). History carries over.
    pub fn set_backend(&mut self, backend: Arc<dyn ChatBackend>) {
        tracing::info!(backend = backend.name(), "Switching chat backend");
        self.backend = backend;
    }

    /// Run one user turn to completion.
    ///
    /// Assistant text is forwarded through `text_tx` as it streams; the
    /// conversation history gains the user message, every tool call/result
    /// pair, and the closing assistant message. Fatal errors leave the
    /// partial turn in history so the user can retry in context.
    pub async fn run_turn(
        &mut self,
        user_input: &str,
        text_tx: mpsc::Sender<String>,
    ) -> Result<TurnOutcome> {
        self.validator.check_message(user_input)?;
        self.history.push(Message::user(user_input));

        let advertised = {
            let registry = self.registry.read().expect("tool registry poisoned");
            registry.all_descriptors()
        };

        let mut turn_has_tool_call = false;

        for iteration in 1..=self.config.max_tool_iterations {
            tracing::debug!(iteration, "Starting model round-trip");

            let outcome = match self
                .stream_once(advertised.clone(), &text_tx, turn_has_tool_call)
                .await
            {
                Ok(outcome) => outcome,
                Err(GatewayError::ToolsUnsupported(msg)) if !advertised.is_empty() => {
                    // One retry without tools; terminal either way, since the
                    // model cannot call anything.
                    tracing::warn!(reason = %msg, "Backend rejected tools; retrying without them");
                    let outcome = self
                        .stream_once(Vec::new(), &text_tx, turn_has_tool_call)
                        .await?;
                    return Ok(match outcome {
                        DecodeOutcome::Cancelled => TurnOutcome::Cancelled,
                        DecodeOutcome::Completed { .. } => TurnOutcome::Completed,
                    });
                }
                Err(e) => return Err(e),
            };

            match outcome {
                DecodeOutcome::Cancelled => return Ok(TurnOutcome::Cancelled),
                DecodeOutcome::Completed { tool_called: true } => {
                    turn_has_tool_call = true;
                }
                DecodeOutcome::Completed { tool_called: false } => {
                    return Ok(TurnOutcome::Completed);
                }
            }
        }

        tracing::error!(
            cap = self.config.max_tool_iterations,
            "Turn exceeded the tool iteration cap"
        );
        Err(GatewayError::MaxToolIterations(self.config.max_tool_iterations))
    }

    /// One model request plus its full decode: rate-limit, open the stream,
    /// register it, decode, release.
    async fn stream_once(
        &mut self,
        tools: Vec<ToolDescriptor>,
        text_tx: &mpsc::Sender<String>,
        turn_has_tool_call: bool,
    ) -> Result<DecodeOutcome> {
        self.rate_limiter.acquire().await;

        // Anything still registered belongs to an earlier failed round;
        // close before opening a new stream.
        self.streams.close_all().await;

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: self.history.messages().to_vec(),
            tools,
            temperature: self.config.temperature,
        };

        let stream = self.backend.stream_chat(request).await?;
        let session = self.streams.register(StreamSession::new(stream));
        let session_id = session.lock().await.id();

        let result = StreamDecoder::new()
            .run(
                session,
                self.config.stream_timeout,
                text_tx,
                &self.dispatcher,
                &mut self.history,
                turn_has_tool_call,
            )
            .await;

        // Evict on every path; the decoder already closed the session.
        self.streams.release(session_id).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeltaStream, FinishReason, StreamDelta, ToolCallDelta};
    use crate::dispatch::{ToolContent, ToolRegistry, ToolTransport};
    use crate::message::Role;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use std::sync::{Mutex, RwLock};

    /// Plays back scripted streams in order and records each request
    struct ScriptedBackend {
        scripts: Mutex<Vec<Vec<Result<StreamDelta>>>>,
        requests: Mutex<Vec<ChatRequest>>,
        reject_tools: bool,
    }

    impl ScriptedBackend {
        fn new(scripts: Vec<Vec<Result<StreamDelta>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts),
                requests: Mutex::new(Vec::new()),
                reject_tools: false,
            })
        }

        fn rejecting_tools(scripts: Vec<Vec<Result<StreamDelta>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts),
                requests: Mutex::new(Vec::new()),
                reject_tools: true,
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn stream_chat(&self, request: ChatRequest) -> Result<DeltaStream> {
            if self.reject_tools && !request.tools.is_empty() {
                self.requests.lock().unwrap().push(request);
                return Err(GatewayError::ToolsUnsupported(
                    "function calling is not enabled for this model".into(),
                ));
            }
            self.requests.lock().unwrap().push(request);
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                return Err(GatewayError::Backend("script exhausted".into()));
            }
            Ok(Box::pin(stream::iter(scripts.remove(0))))
        }
    }

    struct StubTransport;

    #[async_trait]
    impl ToolTransport for StubTransport {
        async fn invoke(
            &self,
            _connection: &str,
            tool: &str,
            _args: &serde_json::Value,
        ) -> Result<Vec<ToolContent>> {
            Ok(vec![ToolContent::Text { text: format!("{} results", tool) }])
        }
    }

    fn registry_with(tools: &[&str]) -> SharedToolRegistry {
        let mut reg = ToolRegistry::new();
        if !tools.is_empty() {
            reg.register_connection(
                "homes",
                tools
                    .iter()
                    .map(|n| ToolDescriptor {
                        name: (*n).into(),
                        description: String::new(),
                        parameters: json!({"type": "object"}),
                    })
                    .collect(),
            );
        }
        Arc::new(RwLock::new(reg))
    }

    fn client(backend: Arc<ScriptedBackend>, registry: SharedToolRegistry) -> ChatClient {
        ChatClient::new(backend, registry, Arc::new(StubTransport), ChatConfig::default())
    }

    fn text(content: &str) -> Result<StreamDelta> {
        Ok(StreamDelta { content: Some(content.into()), ..Default::default() })
    }

    fn finish(reason: FinishReason) -> Result<StreamDelta> {
        Ok(StreamDelta { finish_reason: Some(reason), ..Default::default() })
    }

    fn whole_tool_call(name: &str, args: &str) -> Result<StreamDelta> {
        Ok(StreamDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some(format!("call_{}", name)),
                name: Some(name.into()),
                arguments: Some(args.into()),
            }],
            ..Default::default()
        })
    }

    async fn collect(mut rx: mpsc::Receiver<String>) -> String {
        let mut out = String::new();
        while let Some(t) = rx.recv().await {
            out.push_str(&t);
        }
        out
    }

    #[tokio::test]
    async fn test_plain_text_turn() {
        let backend = ScriptedBackend::new(vec![vec![
            text("Hi! How can "),
            text("I help?"),
            finish(FinishReason::Stop),
        ]]);
        let mut client = client(backend.clone(), registry_with(&[]));
        let (tx, rx) = mpsc::channel(64);

        let outcome = client.run_turn("Hello", tx).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(collect(rx).await, "Hi! How can I help?");

        // system, user, assistant
        let roles: Vec<_> = client.history().messages().iter().map(|m| m.role.clone()).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_tool_call_then_final_answer() {
        let backend = ScriptedBackend::new(vec![
            vec![
                whole_tool_call("search_properties", r#"{"location":"NYC"}"#),
                finish(FinishReason::ToolCalls),
            ],
            vec![text("Found 3 listings in NYC."), finish(FinishReason::Stop)],
        ]);
        let mut client = client(backend.clone(), registry_with(&["search_properties"]));
        let (tx, rx) = mpsc::channel(64);

        let outcome = client.run_turn("Find homes in NYC", tx).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(collect(rx).await, "Found 3 listings in NYC.");

        // system, user, assistant(tool_call), tool, assistant
        let messages = client.history().messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[2].tool_calls[0].name, "search_properties");
        assert_eq!(messages[3].role, Role::Tool);
        assert!(messages[3].content.contains("search_properties results"));
        assert_eq!(messages[4].content, "Found 3 listings in NYC.");

        // Second request replayed the tool exchange to the model
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 4);
        assert!(!requests[1].tools.is_empty());
    }

    #[tokio::test]
    async fn test_tools_rejected_falls_back_once_without_tools() {
        let backend = ScriptedBackend::rejecting_tools(vec![vec![
            text("Answering without tools."),
            finish(FinishReason::Stop),
        ]]);
        let mut client = client(backend.clone(), registry_with(&["search_properties"]));
        let (tx, rx) = mpsc::channel(64);

        let outcome = client.run_turn("Find homes", tx).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(collect(rx).await, "Answering without tools.");

        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].tools.is_empty());
        assert!(requests[1].tools.is_empty());
    }

    #[tokio::test]
    async fn test_iteration_cap_is_fatal() {
        // Every round produces another tool call; the turn must not spin
        let scripts = (0..4)
            .map(|_| {
                vec![
                    whole_tool_call("search_properties", "{}"),
                    finish(FinishReason::ToolCalls),
                ]
            })
            .collect();
        let backend = ScriptedBackend::new(scripts);
        let mut client = ChatClient::new(
            backend.clone(),
            registry_with(&["search_properties"]),
            Arc::new(StubTransport),
            ChatConfig {
                max_tool_iterations: 3,
                requests_per_minute: 100,
                ..ChatConfig::default()
            },
        );
        let (tx, _rx) = mpsc::channel(64);

        let result = client.run_turn("loop forever", tx).await;
        assert!(matches!(result, Err(GatewayError::MaxToolIterations(3))));
        assert_eq!(backend.requests().len(), 3);
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_timeout_leaves_no_partial_state() {
        struct HangingBackend;

        #[async_trait]
        impl ChatBackend for HangingBackend {
            fn name(&self) -> &str {
                "hanging"
            }
            async fn health_check(&self) -> Result<bool> {
                Ok(true)
            }
            async fn stream_chat(&self, _request: ChatRequest) -> Result<DeltaStream> {
                Ok(Box::pin(stream::pending()))
            }
        }

        let mut client = ChatClient::new(
            Arc::new(HangingBackend),
            registry_with(&[]),
            Arc::new(StubTransport),
            ChatConfig { stream_timeout: Duration::from_secs(30), ..ChatConfig::default() },
        );
        let (tx, _rx) = mpsc::channel(64);

        let result = client.run_turn("hello?", tx).await;
        assert!(matches!(result, Err(GatewayError::StreamTimeout(30))));

        // Stream evicted, no tool or assistant message from the dead stream
        assert_eq!(client.active_streams(), 0);
        let roles: Vec<_> = client.history().messages().iter().map(|m| m.role.clone()).collect();
        assert_eq!(roles, vec![Role::System, Role::User]);
    }

    #[tokio::test]
    async fn test_caller_disconnect_cancels_silently() {
        let backend = ScriptedBackend::new(vec![vec![
            text("you will never see this"),
            finish(FinishReason::Stop),
        ]]);
        let mut client = client(backend, registry_with(&[]));
        let (tx, rx) = mpsc::channel(64);
        drop(rx);

        let outcome = client.run_turn("Hello", tx).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_empty_input_rejected_before_any_request() {
        let backend = ScriptedBackend::new(vec![]);
        let mut client = client(backend.clone(), registry_with(&[]));
        let (tx, _rx) = mpsc::channel(64);

        let result = client.run_turn("   ", tx).await;
        assert!(matches!(result, Err(GatewayError::InvalidInput(_))));
        assert!(backend.requests().is_empty());
        // Only the system prompt; the bad input never entered history
        assert_eq!(client.history().len(), 1);
    }

    #[tokio::test]
    async fn test_json_transcript_fallback_drives_tool_loop() {
        // Model without native tool calling emits the call as JSON text,
        // then answers normally once the result is in context
        let backend = ScriptedBackend::new(vec![
            vec![
                text(r#"{"name":"search_properties","arguments":{"location":"NYC"}}"#),
                finish(FinishReason::Stop),
            ],
            vec![finish(FinishReason::Stop)],
        ]);
        let mut client = client(backend.clone(), registry_with(&["search_properties"]));
        let (tx, _rx) = mpsc::channel(64);

        let outcome = client.run_turn("Find homes in NYC", tx).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed);

        // Second round was empty, so the acknowledgment fallback fired
        let last = client.history().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.content.contains("processed your request"));
        assert_eq!(backend.requests().len(), 2);
    }
}
