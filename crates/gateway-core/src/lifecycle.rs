//! Stream Lifecycle Management
//!
//! Every in-flight model response stream is wrapped in a [`StreamSession`]
//! and registered with a [`StreamLifecycleManager`], which guarantees each
//! stream is closed exactly once on completion, error, timeout, cancellation,
//! or client disconnect. Closure never fails loudly: it runs on every exit
//! path, so anything that goes wrong during close is logged and suppressed.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{DeltaStream, StreamDelta};
use crate::error::Result;

/// Lifecycle states of a stream session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

/// Anything that can be shut down on a cleanup path.
///
/// One polymorphic close call replaces per-type probing for close-like
/// methods; `close` must be idempotent and must not panic.
#[async_trait]
pub trait Closable: Send {
    async fn close(&mut self);
}

/// Wraps one provider response stream for its lifetime.
///
/// At most one `StreamSession` exists per in-flight model request.
pub struct StreamSession {
    id: Uuid,
    state: SessionState,
    inner: Option<DeltaStream>,
}

impl StreamSession {
    pub fn new(stream: DeltaStream) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Active,
            inner: Some(stream),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Pull the next delta off the underlying stream.
    ///
    /// Returns `None` once the stream is exhausted or the session closed.
    pub async fn next_delta(&mut self) -> Option<Result<StreamDelta>> {
        match self.inner.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        }
    }
}

#[async_trait]
impl Closable for StreamSession {
    async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;
        // Dropping the boxed stream tears down the underlying connection.
        if let Some(stream) = self.inner.take() {
            drop(stream);
            tracing::debug!(session = %self.id, "Stream session closed");
        }
        self.state = SessionState::Closed;
    }
}

/// Shared handle to a session, so the manager can close a stream the
/// decoder is still holding.
pub type SharedStreamSession = Arc<Mutex<StreamSession>>;

/// Tracks all in-flight streams for one conversation.
///
/// Owned by a single orchestrator; no cross-conversation sharing.
#[derive(Default)]
pub struct StreamLifecycleManager {
    active: Vec<SharedStreamSession>,
}

impl StreamLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session, returning the shared handle
    pub fn register(&mut self, session: StreamSession) -> SharedStreamSession {
        let id = session.id();
        let shared = Arc::new(Mutex::new(session));
        self.active.push(shared.clone());
        tracing::debug!(session = %id, active = self.active.len(), "Stream registered");
        shared
    }

    /// Close and evict one session. Idempotent: releasing an unknown or
    /// already-closed session is a no-op.
    pub async fn release(&mut self, id: Uuid) {
        let Some(pos) = self.position(id).await else {
            return;
        };
        let shared = self.active.remove(pos);
        shared.lock().await.close().await;
    }

    /// Close and evict every still-registered session.
    ///
    /// Runs before each new model request; a no-op in the happy path since
    /// each exit path releases its own stream.
    pub async fn close_all(&mut self) {
        for shared in self.active.drain(..) {
            let mut session = shared.lock().await;
            tracing::debug!(session = %session.id(), "Closing leftover stream");
            session.close().await;
        }
    }

    /// Number of registered sessions
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    async fn position(&self, id: Uuid) -> Option<usize> {
        for (i, shared) in self.active.iter().enumerate() {
            if shared.lock().await.id() == id {
                return Some(i);
            }
        }
        None
    }
}
