//! Built-in action handlers.
//!
//! Only `http.webhook` ships with the engine; every other action type is
//! registered by the module that owns it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::catalog::{ActionCatalog, ActionFailure, ActionHandler};

pub const WEBHOOK_ACTION: &str = "http.webhook";

/// Posts the resolved params' `body` to `url`. 4xx responses are
/// permanent failures (the request itself is wrong); 408, 429, 5xx and
/// transport errors are retryable.
pub struct WebhookHandler {
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for WebhookHandler {
    async fn execute(&self, params: &Value) -> std::result::Result<Value, ActionFailure> {
        let url = params
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| ActionFailure::Permanent("webhook params missing 'url'".into()))?;
        let method = params
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("POST");
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| ActionFailure::Permanent(format!("invalid HTTP method '{method}'")))?;

        let mut request = self.client.request(method, url);
        if let Some(headers) = params.get("headers").and_then(|h| h.as_object()) {
            for (name, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(name, v);
                }
            }
        }
        if let Some(body) = params.get("body") {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ActionFailure::Retryable(format!("webhook request failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(json!({"status": status.as_u16()}));
        }

        let msg = format!("webhook returned {status} for {url}");
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            Err(ActionFailure::Retryable(msg))
        } else {
            Err(ActionFailure::Permanent(msg))
        }
    }
}

/// Register the built-in handlers on a catalog.
pub fn register_builtin(catalog: &ActionCatalog, timeout_secs: u64) {
    catalog.register(
        WEBHOOK_ACTION,
        "Deliver the event payload to an HTTP endpoint",
        json!({
            "required": ["url"],
            "properties": {
                "url": {"type": "string"},
                "method": {"type": "string"},
                "headers": {"type": "object"},
                "body": {}
            }
        }),
        &["http.egress"],
        Arc::new(WebhookHandler::new(timeout_secs)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_url_is_permanent() {
        let handler = WebhookHandler::new(5);
        let err = handler.execute(&json!({"body": {}})).await.unwrap_err();
        assert!(matches!(err, ActionFailure::Permanent(_)));
    }

    #[tokio::test]
    async fn test_bad_method_is_permanent() {
        let handler = WebhookHandler::new(5);
        let err = handler
            .execute(&json!({"url": "http://127.0.0.1:1/x", "method": "NOT A METHOD"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionFailure::Permanent(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let handler = WebhookHandler::new(1);
        // Port 1 on loopback refuses connections.
        let err = handler
            .execute(&json!({"url": "http://127.0.0.1:1/hook", "body": {"a": 1}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionFailure::Retryable(_)));
    }

    #[test]
    fn test_builtin_registration() {
        let catalog = ActionCatalog::new();
        register_builtin(&catalog, 5);
        let entry = catalog.entry(WEBHOOK_ACTION).unwrap();
        assert!(entry.is_active);
        assert!(catalog
            .validate_config(WEBHOOK_ACTION, &json!({"url": "https://x.test"}))
            .is_ok());
        assert!(catalog.validate_config(WEBHOOK_ACTION, &json!({})).is_err());
    }
}
