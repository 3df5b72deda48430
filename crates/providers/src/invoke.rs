//! Per-call retry policy binding an adapter to the key manager.
//!
//! The dispatcher calls [`invoke_with_policy`] once per dispatch attempt.
//! Within that attempt: authentication failures invalidate the key and
//! rotate to the next one until the pool is exhausted; rate limits back off
//! exponentially and retry with the same key; an unknown model is rewritten
//! to the provider default once; a timeout gets one retry. Everything else
//! escalates to the dispatcher as a provider failure.

use std::time::Duration;

use {
    tokio::time::sleep,
    tracing::{info, warn},
};

use switchyard_common::{ChatRequest, ResponseEnvelope};

use crate::{
    adapter::ChatProvider,
    error::{ErrorKind, ProviderError},
    keys::{KeyError, KeyManager},
};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Rate-limit retry knobs, from `MAX_RETRIES` and `BASE_RETRY_DELAY`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Exponential backoff for the n-th rate-limit retry (1-indexed),
    /// capped at thirty seconds.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Call `provider` under the retry policy, drawing keys from `keys`.
pub async fn invoke_with_policy(
    provider: &dyn ChatProvider,
    keys: &KeyManager,
    policy: &RetryPolicy,
    request: &ChatRequest,
) -> Result<ResponseEnvelope, ProviderError> {
    let name = provider.name().to_string();
    let mut request = request.clone();
    let mut model_rewritten = false;
    let mut timeout_retried = false;

    'next_key: loop {
        let key = keys.get_next(&name).await.map_err(|err| match err {
            KeyError::AllInvalid(provider) => ProviderError::Auth {
                provider,
                message: "every configured API key has been invalidated".into(),
            },
            other => ProviderError::Other {
                provider: name.clone(),
                message: other.to_string(),
            },
        })?;

        let mut rate_limit_attempts = 0u32;
        loop {
            let err = match provider.invoke(&request, &key).await {
                Ok(envelope) => return Ok(envelope),
                Err(err) => err,
            };

            match err.kind() {
                ErrorKind::Auth => {
                    keys.mark_invalid(&name, &key).await;
                    continue 'next_key;
                }
                ErrorKind::RateLimit => {
                    rate_limit_attempts += 1;
                    if rate_limit_attempts > policy.max_retries {
                        warn!(provider = name, "rate-limit retries exhausted");
                        return Err(err);
                    }
                    let delay = policy.backoff_delay(rate_limit_attempts);
                    warn!(
                        provider = name,
                        attempt = rate_limit_attempts,
                        delay_secs = delay.as_secs_f64(),
                        "rate limited, retrying with the same key"
                    );
                    sleep(delay).await;
                }
                ErrorKind::ModelUnknown => {
                    if model_rewritten {
                        return Err(err);
                    }
                    model_rewritten = true;
                    let fallback = provider.default_model().to_string();
                    info!(
                        provider = name,
                        from = request.model,
                        to = fallback,
                        "model not accepted, retrying with the provider default"
                    );
                    request.model = fallback;
                }
                ErrorKind::Timeout => {
                    if timeout_retried {
                        return Err(err);
                    }
                    timeout_retried = true;
                    warn!(provider = name, "upstream timed out, retrying once");
                }
                ErrorKind::Transport | ErrorKind::Other => return Err(err),
            }
        }
    }
}
