//! chat-gateway HTTP Server
//!
//! Axum-based server exposing the conversational gateway over WebSocket,
//! plus REST endpoints for health, tool-server connections, and search
//! backend warm-up.

mod handlers;
mod state;

use std::sync::Arc;

use axum::{routing::{get, post}, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_backends::{HttpToolTransport, OpenAiCompatBackend};
use gateway_core::orchestrator::ChatConfig;
use gateway_core::{ChatBackend, ToolRegistry};

use crate::handlers::{chat_stream_handler, connect_tools, health_check, wake_backend};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    // Probe chat backends; either may be absent
    let hosted: Option<Arc<dyn ChatBackend>> = match OpenAiCompatBackend::hosted() {
        Ok(backend) => {
            if backend.health_check().await.unwrap_or(false) {
                tracing::info!("✓ Hosted chat backend available");
            } else {
                tracing::warn!("⚠ Hosted backend configured but not responding");
            }
            Some(Arc::new(backend))
        }
        Err(e) => {
            tracing::warn!("⚠ Hosted backend not configured: {}", e);
            None
        }
    };

    let local: Option<Arc<dyn ChatBackend>> = match OpenAiCompatBackend::local() {
        Ok(backend) => {
            if backend.health_check().await.unwrap_or(false) {
                tracing::info!("✓ Local chat backend available");
                Some(Arc::new(backend))
            } else {
                tracing::warn!("⚠ Local backend not responding; toggle disabled");
                tracing::warn!("  Start your local server (e.g. LM Studio) and restart");
                None
            }
        }
        Err(e) => {
            tracing::warn!("⚠ Local backend misconfigured: {}", e);
            None
        }
    };

    let default_backend = if hosted.is_some() { "hosted" } else { "local" };
    if hosted.is_none() && local.is_none() {
        tracing::warn!("⚠ No chat backend available - conversations will fail");
    }

    // Tool transport and registry
    let transport = Arc::new(HttpToolTransport::new()?);
    let registry = Arc::new(std::sync::RwLock::new(ToolRegistry::new()));

    // Optionally connect a tool server straight from the environment
    if let Ok(url) = std::env::var("TOOLS_URL") {
        match transport.connect("default", &url).await {
            Ok(descriptors) => {
                tracing::info!("Registered {} tools:", descriptors.len());
                for d in &descriptors {
                    tracing::info!("  • {}", d.name);
                }
                registry
                    .write()
                    .expect("tool registry poisoned")
                    .register_connection("default", descriptors);
            }
            Err(e) => tracing::warn!("⚠ Tool server at {} not reachable: {}", url, e),
        }
    }

    // Conversation defaults, overridable from the environment
    let mut chat_config = ChatConfig::default();
    if let Ok(model) = std::env::var("CHAT_MODEL") {
        chat_config.model = model;
    }
    if let Ok(prompt) = std::env::var("SYSTEM_PROMPT") {
        chat_config.system_prompt = prompt;
    }

    // Build application state
    let state = AppState {
        hosted,
        local,
        default_backend: default_backend.into(),
        registry,
        transport,
        chat_config,
    };

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        // Health & info
        .route("/health", get(health_check))

        // Conversation API
        .route("/api/chat/stream", get(chat_stream_handler))

        // Tool servers
        .route("/api/tools/connect", post(connect_tools))
        .route("/api/wake", post(wake_backend))

        // Static files (chat frontend)
        .nest_service("/", tower_http::services::ServeDir::new("static"))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 chat-gateway server running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health            - Health check");
    tracing::info!("  GET  /api/chat/stream   - WebSocket conversation");
    tracing::info!("  POST /api/tools/connect - Connect a tool server");
    tracing::info!("  POST /api/wake          - Warm up the search backend");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
