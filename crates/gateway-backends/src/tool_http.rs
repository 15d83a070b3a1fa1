//! HTTP Tool Transport
//!
//! Talks to remote tool servers over HTTP: list their tools on connect,
//! invoke them by name, and map the heterogeneous result content into the
//! gateway's `ToolContent` items. Content kinds the wire format doesn't
//! declare are preserved as `Unsupported` rather than dropped.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use gateway_core::backend::ToolDescriptor;
use gateway_core::dispatch::{ToolContent, ToolTransport};
use gateway_core::error::{GatewayError, Result};
use serde::Deserialize;
use tracing::{debug, info};

/// HTTP transport to one or more tool servers, keyed by connection name
pub struct HttpToolTransport {
    client: reqwest::Client,
    endpoints: RwLock<HashMap<String, String>>,
}

impl HttpToolTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| GatewayError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self { client, endpoints: RwLock::new(HashMap::new()) })
    }

    /// Connect to a tool server: record its endpoint and fetch the tools it
    /// exposes. The caller registers the returned descriptors.
    pub async fn connect(
        &self,
        name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Vec<ToolDescriptor>> {
        let name = name.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let url = format!("{}/tools", base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::ToolInvocation(format!("listing tools: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::ToolInvocation(format!(
                "tool server returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let listing: ToolListing = response
            .json()
            .await
            .map_err(|e| GatewayError::Parse(format!("tool listing: {}", e)))?;

        info!(connection = %name, tools = listing.tools.len(), "Connected to tool server");
        self.endpoints
            .write()
            .expect("endpoint table poisoned")
            .insert(name, base_url);

        Ok(listing.tools)
    }

    /// Forget a connection's endpoint
    pub fn disconnect(&self, name: &str) {
        self.endpoints
            .write()
            .expect("endpoint table poisoned")
            .remove(name);
    }

    fn endpoint(&self, name: &str) -> Option<String> {
        self.endpoints
            .read()
            .expect("endpoint table poisoned")
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn invoke(
        &self,
        connection: &str,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<Vec<ToolContent>> {
        let Some(base_url) = self.endpoint(connection) else {
            return Err(GatewayError::ToolBackendNotFound(connection.to_string()));
        };

        debug!(connection, tool, "Invoking remote tool");

        let url = format!("{}/tools/{}", base_url, tool);
        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| GatewayError::ToolInvocation(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::ToolInvocation(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let result: InvokeResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Parse(format!("tool result: {}", e)))?;

        Ok(result.content.into_iter().map(convert_content).collect())
    }
}

fn convert_content(item: WireContent) -> ToolContent {
    match (item.kind.as_str(), item.text, item.mime_type, item.data) {
        ("text", Some(text), _, _) => ToolContent::Text { text },
        ("image", _, Some(mime_type), Some(data)) => ToolContent::Image { mime_type, data },
        (kind, _, _, _) => ToolContent::Unsupported { kind: kind.to_string() },
    }
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct ToolListing {
    tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    content: Vec<WireContent>,
}

/// One result item; shape varies by kind, so fields are all optional
#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "mimeType")]
    mime_type: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_text_content() {
        let item: WireContent =
            serde_json::from_str(r#"{"type":"text","text":"3 listings"}"#).unwrap();
        assert_eq!(convert_content(item), ToolContent::Text { text: "3 listings".into() });
    }

    #[test]
    fn test_convert_image_content_accepts_both_key_styles() {
        let item: WireContent = serde_json::from_str(
            r#"{"type":"image","mimeType":"image/png","data":"AAAA"}"#,
        )
        .unwrap();
        assert_eq!(
            convert_content(item),
            ToolContent::Image { mime_type: "image/png".into(), data: "AAAA".into() }
        );

        let item: WireContent = serde_json::from_str(
            r#"{"type":"image","mime_type":"image/jpeg","data":"BBBB"}"#,
        )
        .unwrap();
        assert!(matches!(convert_content(item), ToolContent::Image { .. }));
    }

    #[test]
    fn test_convert_unknown_kind_is_preserved() {
        let item: WireContent =
            serde_json::from_str(r#"{"type":"audio","data":"CCCC"}"#).unwrap();
        assert_eq!(convert_content(item), ToolContent::Unsupported { kind: "audio".into() });
    }

    #[test]
    fn test_malformed_image_is_unsupported() {
        // Image without data cannot become a data URI
        let item: WireContent = serde_json::from_str(r#"{"type":"image"}"#).unwrap();
        assert_eq!(convert_content(item), ToolContent::Unsupported { kind: "image".into() });
    }

    #[tokio::test]
    async fn test_invoke_unknown_connection() {
        let transport = HttpToolTransport::new().unwrap();
        let result = transport
            .invoke("nope", "search_properties", &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(GatewayError::ToolBackendNotFound(_))));
    }
}
