//! HTTP/WebSocket Handlers

use std::pin::pin;

use axum::{
    extract::{State, WebSocketUpgrade, ws::{Message, WebSocket}},
    http::StatusCode,
    response::Response,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use gateway_backends::wake_tool_backend;
use gateway_core::orchestrator::{ChatClient, TurnOutcome};

use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub hosted_available: bool,
    pub local_available: bool,
    pub tools_connected: bool,
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub message: String,
    /// Backend toggle: "hosted" or "local"; server default when omitted
    #[serde(default)]
    pub backend: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectToolsRequest {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectToolsResponse {
    pub connection: String,
    pub tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct WakeRequest {
    pub connection: String,
    pub tool: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let hosted_available = match &state.hosted {
        Some(backend) => backend.health_check().await.unwrap_or(false),
        None => false,
    };
    let local_available = match &state.local {
        Some(backend) => backend.health_check().await.unwrap_or(false),
        None => false,
    };
    let tools_connected = {
        let registry = state.registry.read().expect("tool registry poisoned");
        !registry.is_empty()
    };

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        hosted_available,
        local_available,
        tools_connected,
    })
}

/// Connect a remote tool server and register the tools it exposes
pub async fn connect_tools(
    State(state): State<AppState>,
    Json(payload): Json<ConnectToolsRequest>,
) -> Result<Json<ConnectToolsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let descriptors = state
        .transport
        .connect(&payload.name, &payload.url)
        .await
        .map_err(|e| {
            tracing::error!(connection = %payload.name, error = %e, "Tool server connection failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: e.user_message(),
                    code: "TOOL_CONNECT_ERROR".into(),
                }),
            )
        })?;

    let names: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
    {
        let mut registry = state.registry.write().expect("tool registry poisoned");
        registry.register_connection(&payload.name, descriptors);
    }

    Ok(Json(ConnectToolsResponse {
        connection: payload.name,
        tools: names,
    }))
}

/// Warm up a scale-to-zero search backend behind a tool connection
pub async fn wake_backend(
    State(state): State<AppState>,
    Json(payload): Json<WakeRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    wake_tool_backend(state.transport.as_ref(), &payload.connection, &payload.tool)
        .await
        .map_err(|e| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.user_message(),
                    code: "WAKE_FAILED".into(),
                }),
            )
        })?;

    Ok(StatusCode::OK)
}

/// WebSocket streaming chat; one conversation per socket
pub async fn chat_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_conversation(socket, state))
}

async fn handle_conversation(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let Some(default_backend) = state.backend(&state.default_backend) else {
        let error = serde_json::json!({"type": "error", "error": "No chat backend is available"});
        let _ = sender.send(Message::Text(error.to_string().into())).await;
        return;
    };

    // Conversation state lives for the life of the socket
    let mut client = ChatClient::new(
        default_backend,
        state.registry.clone(),
        state.transport.clone(),
        state.chat_config.clone(),
    );

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!("WebSocket error: {}", e);
                break;
            }
            _ => continue,
        };

        let request: TurnRequest = match serde_json::from_str(&msg) {
            Ok(r) => r,
            Err(e) => {
                let error = serde_json::json!({"type": "error", "error": e.to_string()});
                let _ = sender.send(Message::Text(error.to_string().into())).await;
                continue;
            }
        };

        if let Some(name) = &request.backend {
            match state.backend(name) {
                Some(backend) => client.set_backend(backend),
                None => {
                    let error = serde_json::json!({
                        "type": "error",
                        "error": format!("Unknown backend '{}'", name),
                    });
                    let _ = sender.send(Message::Text(error.to_string().into())).await;
                    continue;
                }
            }
        }

        if run_turn_over_socket(&mut client, &request.message, &mut sender).await.is_err() {
            break; // socket gone
        }
    }
}

/// Drive one turn, interleaving streamed text with the turn future.
///
/// Returns `Err(())` only when the socket itself is dead.
async fn run_turn_over_socket(
    client: &mut ChatClient,
    message: &str,
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
) -> std::result::Result<(), ()> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let mut turn = pin!(client.run_turn(message, tx));
    let mut turn_result = None;

    loop {
        tokio::select! {
            result = &mut turn, if turn_result.is_none() => {
                turn_result = Some(result);
            }
            chunk = rx.recv() => match chunk {
                Some(content) => {
                    let frame = serde_json::json!({"type": "chunk", "content": content});
                    if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                        // Receiver (rx) drops with this frame unsent; the
                        // orchestrator sees the hangup and cancels.
                        return Err(());
                    }
                }
                // Channel closed: the turn is done and fully drained
                None => break,
            }
        }
    }

    let frame = match turn_result {
        Some(Ok(TurnOutcome::Completed)) => serde_json::json!({"type": "done"}),
        Some(Ok(TurnOutcome::Cancelled)) => return Err(()),
        Some(Err(e)) => {
            tracing::error!("Turn failed: {}", e);
            serde_json::json!({"type": "error", "error": e.user_message()})
        }
        // rx closed before the turn resolved; finish it out
        None => match turn.await {
            Ok(TurnOutcome::Completed) => serde_json::json!({"type": "done"}),
            Ok(TurnOutcome::Cancelled) => return Err(()),
            Err(e) => {
                tracing::error!("Turn failed: {}", e);
                serde_json::json!({"type": "error", "error": e.user_message()})
            }
        },
    };

    sender
        .send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|_| ())
}
