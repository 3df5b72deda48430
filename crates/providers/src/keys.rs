//! Credential pool management.
//!
//! Each provider owns an ordered list of API keys served round-robin. A
//! per-key sliding window of the last second's uses enforces the per-key
//! RPS budget; the global token bucket handles gateway-wide pacing. Keys
//! that fail authentication are marked invalid and never handed out again
//! for the lifetime of the process.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use {
    serde::Serialize,
    tokio::time::{Instant, sleep},
    tracing::{debug, info, warn},
};

use thiserror::Error;

const KEY_WINDOW: Duration = Duration::from_secs(1);
const SATURATED_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unknown provider {0:?}")]
    UnknownProvider(String),

    #[error("no API keys configured for {0}")]
    NoKeys(String),

    #[error("all API keys for {0} are invalid")]
    AllInvalid(String),
}

/// Usage statistics for one key, with the key itself masked.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub key: String,
    pub provider: String,
    pub usage_count: u64,
    pub last_used: Option<String>,
    pub invalid: bool,
}

struct KeyState {
    key: String,
    window: VecDeque<Instant>,
    invalid: bool,
    usage_count: u64,
    last_used_ms: Option<u64>,
}

impl KeyState {
    fn new(key: String) -> Self {
        Self {
            key,
            window: VecDeque::new(),
            invalid: false,
            usage_count: 0,
            last_used_ms: None,
        }
    }

    /// Drop window entries older than one second and report whether the key
    /// still has budget.
    fn has_budget(&mut self, now: Instant, budget: usize) -> bool {
        while self
            .window
            .front()
            .is_some_and(|used| now.duration_since(*used) > KEY_WINDOW)
        {
            self.window.pop_front();
        }
        self.window.len() < budget
    }
}

struct Pool {
    keys: Vec<KeyState>,
    cursor: usize,
}

pub struct KeyManager {
    pools: tokio::sync::Mutex<HashMap<String, Pool>>,
    rate_limit_rps: usize,
}

impl KeyManager {
    /// Build the manager from `(provider, keys)` pools.
    #[must_use]
    pub fn new(
        rate_limit_rps: u32,
        pools: impl IntoIterator<Item = (String, Vec<String>)>,
    ) -> Self {
        let pools = pools
            .into_iter()
            .map(|(provider, keys)| {
                let pool = Pool {
                    keys: keys.into_iter().map(KeyState::new).collect(),
                    cursor: 0,
                };
                (provider, pool)
            })
            .collect::<HashMap<_, _>>();
        info!(
            providers = ?pools.keys().collect::<Vec<_>>(),
            "key manager initialized"
        );
        Self {
            pools: tokio::sync::Mutex::new(pools),
            rate_limit_rps: rate_limit_rps.max(1) as usize,
        }
    }

    /// Next usable key for `provider`, round-robin, respecting each key's
    /// one-second budget. Blocks (in 100 ms steps) while every valid key is
    /// saturated; fails fast when the provider has no usable keys at all.
    pub async fn get_next(&self, provider: &str) -> Result<String, KeyError> {
        loop {
            {
                let mut pools = self.pools.lock().await;
                let pool = pools
                    .get_mut(provider)
                    .ok_or_else(|| KeyError::UnknownProvider(provider.to_string()))?;
                if pool.keys.is_empty() {
                    return Err(KeyError::NoKeys(provider.to_string()));
                }
                if pool.keys.iter().all(|k| k.invalid) {
                    return Err(KeyError::AllInvalid(provider.to_string()));
                }

                let now = Instant::now();
                let budget = self.rate_limit_rps;
                for _ in 0..pool.keys.len() {
                    let index = pool.cursor;
                    pool.cursor = (pool.cursor + 1) % pool.keys.len();

                    let state = &mut pool.keys[index];
                    if state.invalid {
                        continue;
                    }
                    if state.has_budget(now, budget) {
                        state.window.push_back(now);
                        state.usage_count += 1;
                        state.last_used_ms = Some(switchyard_common::unix_ms());
                        debug!(provider, key = %mask(&state.key), "handing out API key");
                        return Ok(state.key.clone());
                    }
                }
            }

            warn!(provider, "every API key is at its rate budget, waiting");
            sleep(SATURATED_BACKOFF).await;
        }
    }

    /// Mark a key invalid after an authentication failure. Invalidation is
    /// monotonic for the process lifetime.
    pub async fn mark_invalid(&self, provider: &str, key: &str) {
        let mut pools = self.pools.lock().await;
        if let Some(state) = pools
            .get_mut(provider)
            .and_then(|pool| pool.keys.iter_mut().find(|k| k.key == key))
        {
            if !state.invalid {
                warn!(provider, key = %mask(key), "marking API key invalid");
            }
            state.invalid = true;
        }
    }

    /// Add a key to a provider's pool at runtime. Returns `false` when the
    /// key is empty or already present.
    pub async fn add_key(&self, provider: &str, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        let mut pools = self.pools.lock().await;
        let pool = pools.entry(provider.to_string()).or_insert(Pool {
            keys: Vec::new(),
            cursor: 0,
        });
        if pool.keys.iter().any(|k| k.key == key) {
            return false;
        }
        pool.keys.push(KeyState::new(key.to_string()));
        info!(provider, "added API key to pool");
        true
    }

    /// Remove a key from a provider's pool. Returns `false` when absent.
    pub async fn remove_key(&self, provider: &str, key: &str) -> bool {
        let mut pools = self.pools.lock().await;
        let Some(pool) = pools.get_mut(provider) else {
            return false;
        };
        let before = pool.keys.len();
        pool.keys.retain(|k| k.key != key);
        if pool.keys.len() == before {
            return false;
        }
        if pool.cursor >= pool.keys.len() {
            pool.cursor = 0;
        }
        info!(provider, "removed API key from pool");
        true
    }

    /// Masked usage statistics, keyed `{provider}_{index}`. With a provider
    /// filter, only that pool is reported.
    pub async fn stats(&self, provider: Option<&str>) -> HashMap<String, KeyStats> {
        let pools = self.pools.lock().await;
        let mut stats = HashMap::new();
        for (name, pool) in pools.iter() {
            if provider.is_some_and(|wanted| wanted != name) {
                continue;
            }
            for (index, state) in pool.keys.iter().enumerate() {
                stats.insert(
                    format!("{name}_{index}"),
                    KeyStats {
                        key: mask(&state.key),
                        provider: name.clone(),
                        usage_count: state.usage_count,
                        last_used: state.last_used_ms.and_then(format_timestamp),
                        invalid: state.invalid,
                    },
                );
            }
        }
        stats
    }
}

/// Mask a key for display: first four and last four characters.
fn mask(key: &str) -> String {
    if key.len() < 8 {
        return "****".to_string();
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}

fn format_timestamp(ms: u64) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(ms as i64).map(|dt| dt.to_rfc3339())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn manager(rps: u32, keys: &[&str]) -> KeyManager {
        KeyManager::new(
            rps,
            [(
                "grok".to_string(),
                keys.iter().map(|k| k.to_string()).collect(),
            )],
        )
    }

    #[tokio::test]
    async fn keys_rotate_round_robin() {
        let keys = manager(100, &["key-aaaa", "key-bbbb"]);
        assert_eq!(keys.get_next("grok").await.unwrap(), "key-aaaa");
        assert_eq!(keys.get_next("grok").await.unwrap(), "key-bbbb");
        assert_eq!(keys.get_next("grok").await.unwrap(), "key-aaaa");
    }

    #[tokio::test]
    async fn invalid_keys_are_skipped() {
        let keys = manager(100, &["key-aaaa", "key-bbbb"]);
        keys.mark_invalid("grok", "key-aaaa").await;
        assert_eq!(keys.get_next("grok").await.unwrap(), "key-bbbb");
        assert_eq!(keys.get_next("grok").await.unwrap(), "key-bbbb");
    }

    #[tokio::test]
    async fn all_invalid_is_an_error() {
        let keys = manager(100, &["key-aaaa"]);
        keys.mark_invalid("grok", "key-aaaa").await;
        let err = keys.get_next("grok").await.unwrap_err();
        assert!(matches!(err, KeyError::AllInvalid(p) if p == "grok"));
    }

    #[tokio::test]
    async fn unknown_provider_and_empty_pool_fail_fast() {
        let keys = manager(100, &[]);
        assert!(matches!(
            keys.get_next("anthropic").await.unwrap_err(),
            KeyError::UnknownProvider(_)
        ));
        assert!(matches!(
            keys.get_next("grok").await.unwrap_err(),
            KeyError::NoKeys(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_key_waits_for_its_window_to_clear() {
        let keys = manager(1, &["key-aaaa"]);
        assert_eq!(keys.get_next("grok").await.unwrap(), "key-aaaa");

        let started = Instant::now();
        // Budget of one use per second: the second acquisition has to wait
        // for the window to slide past the first use.
        assert_eq!(keys.get_next("grok").await.unwrap(), "key-aaaa");
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn stats_mask_keys_and_count_usage() {
        let keys = manager(100, &["key-abcdef-0001", "key-abcdef-0002"]);
        keys.get_next("grok").await.unwrap();
        keys.get_next("grok").await.unwrap();
        keys.get_next("grok").await.unwrap();

        let stats = keys.stats(Some("grok")).await;
        let first = &stats["grok_0"];
        assert_eq!(first.key, "key-...0001");
        assert_eq!(first.usage_count, 2);
        assert!(first.last_used.is_some());
        assert_eq!(stats["grok_1"].usage_count, 1);
        assert!(!stats["grok_0"].invalid);
    }

    #[tokio::test]
    async fn add_and_remove_keys_mutate_the_pool() {
        let keys = manager(100, &["key-aaaa"]);
        assert!(keys.add_key("grok", "key-bbbb").await);
        assert!(!keys.add_key("grok", "key-bbbb").await);
        assert!(keys.remove_key("grok", "key-aaaa").await);
        assert!(!keys.remove_key("grok", "key-aaaa").await);
        assert_eq!(keys.get_next("grok").await.unwrap(), "key-bbbb");
    }
}
