//! LLM provider adapters, the credential pool, and the invoke retry policy.
//!
//! Every upstream is wrapped in a [`ChatProvider`] adapter that normalizes
//! native error shapes into the classified [`ErrorKind`] taxonomy; the
//! dispatcher never inspects raw upstream errors. Adapters are registered
//! in a [`ProviderRegistry`] keyed by provider name, credentials live in
//! the [`KeyManager`], and [`invoke_with_policy`] binds the two with the
//! per-call retry rules (key rotation on auth failures, same-key backoff on
//! rate limits, a one-shot model rewrite, a one-shot timeout retry).

mod adapter;
mod cost;
mod error;
mod invoke;
mod keys;
mod registry;

pub use {
    adapter::{ChatProvider, OpenAiCompatProvider},
    cost::CostTable,
    error::{ErrorKind, ProviderError},
    invoke::{RetryPolicy, invoke_with_policy},
    keys::{KeyError, KeyManager, KeyStats},
    registry::ProviderRegistry,
};

/// Shared HTTP client for provider adapters.
///
/// Adapters reuse one client so upstream calls share connection pools, DNS
/// cache, and TLS sessions.
pub fn shared_http_client() -> &'static reqwest::Client {
    static CLIENT: std::sync::LazyLock<reqwest::Client> =
        std::sync::LazyLock::new(reqwest::Client::new);
    &CLIENT
}
