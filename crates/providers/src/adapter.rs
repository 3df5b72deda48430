//! OpenAI-compatible chat-completions adapter.
//!
//! Both supported upstreams (grok and openai) speak the same wire protocol,
//! so one implementation is instantiated per provider with its own base
//! URL, default model and model catalog.

use std::time::Duration;

use {
    serde::Deserialize,
    tracing::{debug, warn},
};

use switchyard_common::{ChatRequest, ResponseEnvelope, Usage};

use crate::{
    error::{ErrorKind, ProviderError},
    shared_http_client,
};

const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

const GROK_MODELS: &[&str] = &["grok-3-mini-fast", "grok-3-mini", "grok-3-fast", "grok-3"];
const OPENAI_MODELS: &[&str] = &[
    "gpt-4.1-2025-04-14",
    "gpt-4.1-mini-2025-04-14",
    "gpt-4o-2024-11-20",
];

/// A black-box upstream: invoke, probe, and describe the model catalog.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    fn models(&self) -> Vec<String>;

    /// Minimal reachability round-trip. `true` means the upstream answered
    /// like a live service; credential problems do not count as downtime.
    async fn health_check(&self) -> bool;

    /// One upstream call with one credential, normalized into either a
    /// completed envelope or a classified error.
    async fn invoke(
        &self,
        request: &ChatRequest,
        api_key: &str,
    ) -> Result<ResponseEnvelope, ProviderError>;
}

pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    default_model: String,
    models: Vec<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
        models: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
            models,
            client: shared_http_client().clone(),
        }
    }

    #[must_use]
    pub fn grok(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self::new(
            "grok",
            base_url,
            default_model,
            GROK_MODELS.iter().map(|m| m.to_string()).collect(),
        )
    }

    #[must_use]
    pub fn openai(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self::new(
            "openai",
            base_url,
            default_model,
            OPENAI_MODELS.iter().map(|m| m.to_string()).collect(),
        )
    }

    fn classify_status(&self, status: reqwest::StatusCode, body: &str) -> ProviderError {
        let kind = match status.as_u16() {
            401 | 403 => ErrorKind::Auth,
            429 => ErrorKind::RateLimit,
            408 => ErrorKind::Timeout,
            code if code >= 500 => ErrorKind::Transport,
            _ if mentions_unknown_model(body) => ErrorKind::ModelUnknown,
            404 => ErrorKind::ModelUnknown,
            _ => ErrorKind::Other,
        };
        let message = format!("HTTP {status}: {}", truncate(body, 200));
        ProviderError::new(kind, &self.name, message)
    }

    fn classify_transport(&self, err: &reqwest::Error) -> ProviderError {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() || err.is_request() {
            ErrorKind::Transport
        } else {
            ErrorKind::Other
        };
        ProviderError::new(kind, &self.name, err.to_string())
    }

    fn request_body(&self, request: &ChatRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = temperature.into();
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = top_p.into();
        }
        // `response_format` is an opaque token at this layer; anything other
        // than plain text maps to the upstream's JSON-object mode.
        if let Some(format) = &request.response_format
            && format != "text"
        {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            // Any answer below 500 means the service is up; 401 here is a
            // missing credential, not an outage.
            Ok(response) => response.status().as_u16() < 500,
            Err(err) => {
                warn!(provider = self.name, %err, "health probe failed");
                false
            }
        }
    }

    async fn invoke(
        &self,
        request: &ChatRequest,
        api_key: &str,
    ) -> Result<ResponseEnvelope, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = self.name, model = request.model, "invoking upstream");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&self.request_body(request))
            .timeout(INVOKE_TIMEOUT)
            .send()
            .await
            .map_err(|err| self.classify_transport(&err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, &body));
        }

        let completion: ChatCompletion = response.json().await.map_err(|err| {
            ProviderError::new(
                ErrorKind::Other,
                &self.name,
                format!("undecodable completion body: {err}"),
            )
        })?;

        Ok(self.envelope_from(request, completion))
    }
}

impl OpenAiCompatProvider {
    fn envelope_from(&self, request: &ChatRequest, completion: ChatCompletion) -> ResponseEnvelope {
        let model = completion.model.unwrap_or_else(|| request.model.clone());
        let mut envelope = ResponseEnvelope::completed(&self.name, model);

        if let Some(choice) = completion.choices.into_iter().next() {
            envelope.finish_reason = choice.finish_reason;
            if let Some(content) = choice.message.and_then(|m| m.content) {
                // Surface JSON-mode output as a structured value as well.
                if request.response_format.as_deref().is_some_and(|f| f != "text")
                    && let Ok(value) = serde_json::from_str(&content)
                {
                    envelope.structured_output = Some(value);
                }
                envelope.content = Some(content);
            }
        }
        if let Some(usage) = completion.usage {
            envelope.usage = Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }
        envelope
    }
}

fn mentions_unknown_model(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("model")
        && (lower.contains("not found")
            || lower.contains("does not exist")
            || lower.contains("unsupported")
            || lower.contains("not supported")
            || lower.contains("not available"))
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}
