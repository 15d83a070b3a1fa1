//! Stream Decoding
//!
//! Consumes a live model delta stream, forwarding assistant text to the
//! caller as it arrives while accumulating tool-call fragments in an
//! index-keyed table. When a terminal signal fires, accumulated fragments
//! are finalized and dispatched in index order; a `stop` whose transcript is
//! itself a JSON tool call (providers without structured tool deltas emit
//! these) is synthesized into a call and dispatched the same way.
//!
//! The whole consumption phase runs under a hard wall-clock timeout. A
//! timed-out or cancelled stream is closed exactly once and never dispatches
//! a partial tool call, so conversation history stays consistent.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::{FinishReason, ToolCallDelta};
use crate::dispatch::{ToolCallDispatcher, ToolCallRequest};
use crate::error::{GatewayError, Result};
use crate::lifecycle::{Closable, SharedStreamSession};
use crate::message::{Conversation, Message};

/// Appended when a turn produced tool results but no closing text, so the
/// turn is never silently empty.
const TOOL_ACK_MESSAGE: &str =
    "I've processed your request. Is there anything else you'd like to know?";

/// A tool call under reconstruction, keyed by the provider's parallel-call
/// index. Successive deltas targeting the same index concatenate onto these
/// fields; arrival order within an index is the only ordering guarantee.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallFragment {
    fn absorb(&mut self, delta: ToolCallDelta) {
        if let Some(id) = delta.id {
            self.id.push_str(&id);
        }
        if let Some(name) = delta.name {
            self.name.push_str(&name);
        }
        if let Some(arguments) = delta.arguments {
            self.arguments.push_str(&arguments);
        }
    }

    /// Parse the accumulated arguments string into a dispatchable request.
    /// Invalid JSON means this single call is skipped, not a failed turn.
    fn finalize(&self) -> Option<ToolCallRequest> {
        match serde_json::from_str(&self.arguments) {
            Ok(arguments) => Some(ToolCallRequest {
                id: if self.id.is_empty() {
                    fresh_call_id()
                } else {
                    self.id.clone()
                },
                name: self.name.clone(),
                arguments,
                raw_arguments: self.arguments.clone(),
            }),
            Err(e) => {
                tracing::warn!(
                    tool = %self.name,
                    error = %e,
                    raw = %self.arguments,
                    "Skipping tool call with malformed arguments"
                );
                None
            }
        }
    }
}

/// How one decode pass ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Stream reached a terminal signal; `tool_called` tells the
    /// orchestrator whether to re-enter generation
    Completed { tool_called: bool },
    /// Caller abandoned consumption; cleaned up silently
    Cancelled,
}

/// Where token consumption stopped
enum Terminal {
    Stop,
    ToolCalls,
    Cancelled,
}

/// Decodes one model response stream. Single use: a fresh decoder (and a
/// fresh stream) is needed for each model turn.
#[derive(Default)]
pub struct StreamDecoder {
    fragments: BTreeMap<u32, ToolCallFragment>,
    transcript: String,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive the stream to its terminal signal and fold the results into
    /// `history`.
    ///
    /// `turn_has_tool_call` marks that an earlier stream in this turn
    /// already dispatched a tool, which selects the acknowledgment fallback
    /// when the model closes the turn without any text.
    pub async fn run(
        mut self,
        session: SharedStreamSession,
        timeout: Duration,
        text_tx: &mpsc::Sender<String>,
        dispatcher: &ToolCallDispatcher,
        history: &mut Conversation,
        turn_has_tool_call: bool,
    ) -> Result<DecodeOutcome> {
        let consumed = tokio::time::timeout(timeout, self.consume(&session, text_tx)).await;

        // Exactly-once closure on every exit path; close is idempotent.
        session.lock().await.close().await;

        let terminal = match consumed {
            Err(_) => {
                tracing::warn!(secs = timeout.as_secs(), "Model stream timed out");
                return Err(GatewayError::StreamTimeout(timeout.as_secs()));
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(terminal)) => terminal,
        };

        match terminal {
            Terminal::Cancelled => Ok(DecodeOutcome::Cancelled),
            Terminal::ToolCalls => {
                let tool_called = self.dispatch_fragments(dispatcher, history).await;
                Ok(DecodeOutcome::Completed { tool_called })
            }
            Terminal::Stop => {
                let tool_called = self
                    .handle_stop(dispatcher, history, turn_has_tool_call)
                    .await;
                Ok(DecodeOutcome::Completed { tool_called })
            }
        }
    }

    /// Token-consumption phase: runs until a terminal signal, stream end,
    /// stream error, or the caller hanging up.
    async fn consume(
        &mut self,
        session: &SharedStreamSession,
        text_tx: &mpsc::Sender<String>,
    ) -> Result<Terminal> {
        loop {
            let next = session.lock().await.next_delta().await;

            let delta = match next {
                // Stream ended without an explicit terminal; treat as stop
                None => return Ok(Terminal::Stop),
                Some(Err(e)) => return Err(e),
                Some(Ok(delta)) => delta,
            };

            if delta.is_empty() {
                continue;
            }

            if let Some(content) = delta.content {
                if !content.is_empty() {
                    self.transcript.push_str(&content);
                    // The only caller-visible suspension point: a failed send
                    // means the consumer is gone.
                    if text_tx.send(content).await.is_err() {
                        tracing::debug!("Text consumer hung up; cancelling stream");
                        return Ok(Terminal::Cancelled);
                    }
                }
            }

            for tc in delta.tool_calls {
                self.fragments.entry(tc.index).or_default().absorb(tc);
            }

            match delta.finish_reason {
                Some(FinishReason::ToolCalls) => return Ok(Terminal::ToolCalls),
                Some(FinishReason::Stop) => return Ok(Terminal::Stop),
                None => {}
            }
        }
    }

    /// Finalize and dispatch accumulated fragments in ascending index order,
    /// sequentially, so each result lands in history before the next call.
    async fn dispatch_fragments(
        &mut self,
        dispatcher: &ToolCallDispatcher,
        history: &mut Conversation,
    ) -> bool {
        let mut tool_called = false;
        for fragment in self.fragments.values() {
            let Some(call) = fragment.finalize() else {
                continue;
            };
            dispatcher.dispatch(history, &call).await;
            tool_called = true;
        }
        tool_called
    }

    /// Stop-signal handling: the transcript may be plain prose, or a whole
    /// tool call emitted as JSON text by providers without structured deltas.
    async fn handle_stop(
        &mut self,
        dispatcher: &ToolCallDispatcher,
        history: &mut Conversation,
        turn_has_tool_call: bool,
    ) -> bool {
        let trimmed = self.transcript.trim();

        if trimmed.is_empty() {
            if turn_has_tool_call {
                history.push(Message::assistant(TOOL_ACK_MESSAGE));
            }
            return false;
        }

        if let Some(call) = parse_transcript_tool_call(trimmed) {
            tracing::debug!(tool = %call.name, "Synthesized tool call from transcript");
            dispatcher.dispatch(history, &call).await;
            return true;
        }

        history.push(Message::assistant(self.transcript.clone()));
        false
    }
}

fn fresh_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Try to read the transcript as a `{"name": ..., "arguments": ...}` tool
/// call, tolerating the `<tool_call>` XML wrapper some prompts request.
/// Returns `None` for anything that isn't a complete, well-formed call.
fn parse_transcript_tool_call(transcript: &str) -> Option<ToolCallRequest> {
    let mut content = transcript.trim();
    content = content.strip_prefix("<tool_call>").unwrap_or(content);
    content = content.strip_suffix("</tool_call>").unwrap_or(content);
    content = content.trim();

    if !content.starts_with('{') && !content.starts_with('[') {
        return None;
    }

    let parsed: serde_json::Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Transcript looked like JSON but did not parse");
            return None;
        }
    };

    let obj = parsed.as_object()?;
    let name = obj.get("name")?.as_str()?.to_string();
    let arguments = obj.get("arguments")?.clone();
    let raw_arguments = arguments.to_string();

    Some(ToolCallRequest {
        // Collision-resistant id; content-derived ids repeat across
        // identical calls.
        id: fresh_call_id(),
        name,
        arguments,
        raw_arguments,
    })
}
