//! Search Backend Warm-Up
//!
//! Some search deployments scale their inference model to zero when idle and
//! need a throwaway query to spin back up. This fires one through the tool
//! transport with escalating waits between attempts.

use std::time::Duration;

use gateway_core::dispatch::ToolTransport;
use gateway_core::error::{GatewayError, Result};
use tracing::{info, warn};

/// Delay before retrying each failed attempt
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(15),
];

/// Issue a warm-up call until the backend answers, up to three attempts.
pub async fn wake_tool_backend(
    transport: &dyn ToolTransport,
    connection: &str,
    tool: &str,
) -> Result<()> {
    let args = serde_json::json!({ "query": "warm-up" });

    for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
        match transport.invoke(connection, tool, &args).await {
            Ok(_) => {
                info!(connection, tool, attempt = attempt + 1, "Search backend is awake");
                return Ok(());
            }
            Err(e) => {
                warn!(
                    connection,
                    tool,
                    attempt = attempt + 1,
                    error = %e,
                    "Warm-up attempt failed"
                );
                tokio::time::sleep(*delay).await;
            }
        }
    }

    Err(GatewayError::BackendUnavailable(format!(
        "search backend did not wake after {} attempts",
        RETRY_DELAYS.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_core::dispatch::ToolContent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` invocations, then succeeds
    struct FlakyTransport {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolTransport for FlakyTransport {
        async fn invoke(
            &self,
            _connection: &str,
            _tool: &str,
            _args: &serde_json::Value,
        ) -> Result<Vec<ToolContent>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(GatewayError::ToolInvocation("model loading".into()))
            } else {
                Ok(vec![ToolContent::Text { text: "ok".into() }])
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_succeeds_after_retries() {
        let transport = FlakyTransport { failures: 2, calls: AtomicUsize::new(0) };
        let result = wake_tool_backend(&transport, "homes", "search_properties").await;
        assert!(result.is_ok());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_gives_up_after_three_attempts() {
        let transport = FlakyTransport { failures: 10, calls: AtomicUsize::new(0) };
        let result = wake_tool_backend(&transport, "homes", "search_properties").await;
        assert!(matches!(result, Err(GatewayError::BackendUnavailable(_))));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_first_try_makes_one_call() {
        let transport = FlakyTransport { failures: 0, calls: AtomicUsize::new(0) };
        wake_tool_backend(&transport, "homes", "search_properties").await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
