//! Input Validation
//!
//! Sanitizes user text and tool arguments before they enter the pipeline.

use crate::error::{GatewayError, Result};

/// Validates user messages and sanitizes tool arguments
#[derive(Clone, Debug)]
pub struct InputValidator {
    max_message_len: usize,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl InputValidator {
    pub fn new() -> Self {
        Self { max_message_len: 32_768 }
    }

    pub fn with_max_len(max_message_len: usize) -> Self {
        Self { max_message_len }
    }

    /// Check that a user message is non-empty and within bounds
    pub fn validate_message(&self, message: &str) -> bool {
        let trimmed = message.trim();
        !trimmed.is_empty() && message.len() <= self.max_message_len
    }

    /// Validate a user message, returning a typed error on rejection
    pub fn check_message(&self, message: &str) -> Result<()> {
        if message.trim().is_empty() {
            return Err(GatewayError::InvalidInput("message is empty".into()));
        }
        if message.len() > self.max_message_len {
            return Err(GatewayError::InvalidInput(format!(
                "message exceeds {} bytes",
                self.max_message_len
            )));
        }
        Ok(())
    }

    /// Strip markup and control characters from tool arguments, recursing
    /// through nested objects and arrays. Non-string values pass through.
    pub fn sanitize_tool_args(&self, args: serde_json::Value) -> serde_json::Value {
        match args {
            serde_json::Value::String(s) => serde_json::Value::String(sanitize_str(&s)),
            serde_json::Value::Array(items) => serde_json::Value::Array(
                items.into_iter().map(|v| self.sanitize_tool_args(v)).collect(),
            ),
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.sanitize_tool_args(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

fn sanitize_str(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            // Drop tag-like runs wholesale: everything up to the closing '>'
            '<' => {
                for t in chars.by_ref() {
                    if t == '>' {
                        break;
                    }
                }
            }
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => out.push(c),
        }
    }

    out
}
