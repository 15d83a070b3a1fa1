//! Application State

use std::sync::Arc;

use gateway_backends::HttpToolTransport;
use gateway_core::orchestrator::ChatConfig;
use gateway_core::{ChatBackend, SharedToolRegistry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Hosted chat backend (None if not configured)
    pub hosted: Option<Arc<dyn ChatBackend>>,

    /// Local chat backend (None if unreachable at startup)
    pub local: Option<Arc<dyn ChatBackend>>,

    /// Backend used when a request doesn't pick one
    pub default_backend: String,

    /// Registry of tools exposed by connected tool servers
    pub registry: SharedToolRegistry,

    /// HTTP transport to tool servers
    pub transport: Arc<HttpToolTransport>,

    /// Per-conversation orchestrator settings
    pub chat_config: ChatConfig,
}

impl AppState {
    /// Look up a chat backend by its toggle name
    pub fn backend(&self, name: &str) -> Option<Arc<dyn ChatBackend>> {
        match name {
            "hosted" => self.hosted.clone(),
            "local" => self.local.clone(),
            _ => None,
        }
    }
}
