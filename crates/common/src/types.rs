//! Domain types shared between the queue, the dispatcher, the providers and
//! the HTTP surface.

use serde::{Deserialize, Serialize};

// ── Chat request ─────────────────────────────────────────────────────────────

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A chat-completion request as accepted by the gateway.
///
/// The request is model-agnostic across providers: when the dispatcher
/// rebinds an item to a different provider it rewrites `model` to that
/// provider's default. `response_format` is an opaque token handed through
/// to the adapter layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Empty when the client omitted it; the gateway substitutes the
    /// primary provider's default before queueing.
    #[serde(default)]
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
}

// ── Queue item ───────────────────────────────────────────────────────────────

/// An item travelling through the request queue.
///
/// `tried_providers` and `retry_count` are mutated only by the dispatcher
/// when an item is re-queued after a provider failure. `original_provider`
/// records the provider the item was first bound to, so a rebind can detect
/// that the model name needs rewriting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: String,
    pub data: ChatRequest,
    pub enqueued_at_ms: u64,
    pub priority: u8,
    #[serde(default)]
    pub tried_providers: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_provider: Option<String>,
}

impl QueuedRequest {
    /// Wrap a fresh submission. Priority is clamped to the 0–100 range.
    #[must_use]
    pub fn new(data: ChatRequest, priority: u8) -> Self {
        Self {
            id: crate::request_id(),
            data,
            enqueued_at_ms: crate::unix_ms(),
            priority: priority.min(100),
            tried_providers: Vec::new(),
            retry_count: 0,
            original_provider: None,
        }
    }
}

// ── Response envelope ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Completed,
    Error,
}

/// Token accounting reported by the upstream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Error detail carried by a terminal error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tried_providers: Vec<String>,
}

/// The terminal result published for a request id.
///
/// Exactly one envelope is published per id; the queue backends treat a
/// second `store_response` for the same id as a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: ResponseStatus,
    pub created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ResponseEnvelope {
    /// A successful completion from `provider` using `model`.
    #[must_use]
    pub fn completed(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Completed,
            created: crate::unix_secs(),
            model: Some(model.into()),
            provider: Some(provider.into()),
            finish_reason: None,
            usage: None,
            content: None,
            structured_output: None,
            error: None,
        }
    }

    /// A terminal error after every eligible provider was tried.
    #[must_use]
    pub fn service_error(message: impl Into<String>, tried_providers: Vec<String>) -> Self {
        Self::error_with_kind(message, "llm_service_error", tried_providers)
    }

    /// The dispatcher's per-item processing ceiling elapsed.
    #[must_use]
    pub fn timeout_error(message: impl Into<String>) -> Self {
        Self::error_with_kind(message, "timeout_error", Vec::new())
    }

    fn error_with_kind(
        message: impl Into<String>,
        kind: &str,
        tried_providers: Vec<String>,
    ) -> Self {
        Self {
            status: ResponseStatus::Error,
            created: crate::unix_secs(),
            model: None,
            provider: None,
            finish_reason: None,
            usage: None,
            content: None,
            structured_output: None,
            error: Some(ErrorInfo {
                message: message.into(),
                kind: kind.to_string(),
                tried_providers,
            }),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ResponseStatus::Completed
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request() -> ChatRequest {
        ChatRequest {
            model: "grok-3-mini".into(),
            messages: vec![Message::new("user", "hello")],
            temperature: Some(0.7),
            max_tokens: None,
            top_p: None,
            response_format: None,
        }
    }

    #[test]
    fn queued_request_clamps_priority() {
        let item = QueuedRequest::new(chat_request(), 250);
        assert_eq!(item.priority, 100);
        assert!(item.tried_providers.is_empty());
        assert_eq!(item.retry_count, 0);
    }

    #[test]
    fn queued_request_roundtrips_through_json() {
        let item = QueuedRequest::new(chat_request(), 10);
        let json = serde_json::to_string(&item).unwrap();
        let back: QueuedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, item.id);
        assert_eq!(back.priority, 10);
        assert_eq!(back.data.model, "grok-3-mini");
    }

    #[test]
    fn retry_metadata_defaults_when_absent() {
        // Items written by older processes may lack the retry fields.
        let json = r#"{
            "id": "req_1_00000000",
            "data": {"model": "m", "messages": []},
            "enqueued_at_ms": 1,
            "priority": 10
        }"#;
        let item: QueuedRequest = serde_json::from_str(json).unwrap();
        assert!(item.tried_providers.is_empty());
        assert_eq!(item.retry_count, 0);
        assert!(item.original_provider.is_none());
    }

    #[test]
    fn error_envelope_serializes_type_tag() {
        let env = ResponseEnvelope::timeout_error("took too long");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["type"], "timeout_error");
        assert!(json["error"].get("tried_providers").is_none());
    }

    #[test]
    fn service_error_carries_tried_providers() {
        let env = ResponseEnvelope::service_error("all failed", vec!["grok".into()]);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["error"]["tried_providers"][0], "grok");
    }
}
