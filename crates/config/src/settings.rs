use std::{collections::HashMap, str::FromStr, time::Duration};

use crate::error::{ConfigError, Result};

/// Providers the gateway knows how to construct adapters for.
pub const KNOWN_PROVIDERS: &[&str] = &["grok", "openai"];

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    // HTTP surface
    pub host: String,
    pub port: u16,
    pub server_api_key: String,

    // Providers
    pub llm_provider: String,
    pub default_model: String,
    pub openai_default_model: String,
    pub grok_api_url: String,
    pub openai_api_url: String,
    pub grok_api_keys: Vec<String>,
    pub openai_api_keys: Vec<String>,

    // Pacing and adapter retries
    pub rate_limit_rps: u32,
    pub max_retries: u32,
    pub base_retry_delay_secs: u64,

    // Queue backend
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: i64,
    pub redis_queue_key: String,
    pub response_expiry_secs: u64,

    // Cost accounting (USD per one million tokens)
    pub prompt_token_cost_per_million: f64,
    pub completion_token_cost_per_million: f64,

    // Failover
    pub enable_failover: bool,
    pub failover_providers: Vec<String>,
    pub failover_threshold: u32,
    pub failover_recovery_secs: u64,

    // Health checking
    pub enable_health_checker: bool,
    pub health_check_interval_secs: u64,
    /// Optional per-provider HTTP health endpoints; a probe prefers these
    /// over a live adapter round-trip.
    pub health_endpoints: HashMap<String, String>,

    // Metrics
    pub enable_metrics: bool,
    pub metrics_window_hours: u64,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary lookup function.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let settings = Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "PORT", 8000)?,
            server_api_key: get("SERVER_API_KEY").unwrap_or_default(),

            llm_provider: get("LLM_PROVIDER").unwrap_or_else(|| "openai".into()),
            default_model: get("DEFAULT_MODEL").unwrap_or_else(|| "grok-2-1212".into()),
            openai_default_model: get("OPENAI_DEFAULT_MODEL")
                .unwrap_or_else(|| "gpt-4.1-2025-04-14".into()),
            grok_api_url: get("GROK_API_URL").unwrap_or_else(|| "https://api.x.ai/v1".into()),
            openai_api_url: get("OPENAI_API_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            grok_api_keys: parse_list(get("GROK_API_KEYS")),
            openai_api_keys: parse_list(get("OPENAI_API_KEYS")),

            rate_limit_rps: parse_or(&get, "RATE_LIMIT_RPS", 7)?,
            max_retries: parse_or(&get, "MAX_RETRIES", 5)?,
            base_retry_delay_secs: parse_or(&get, "BASE_RETRY_DELAY", 1)?,

            redis_host: get("REDIS_HOST").unwrap_or_else(|| "localhost".into()),
            redis_port: parse_or(&get, "REDIS_PORT", 6379)?,
            redis_db: parse_or(&get, "REDIS_DB", 0)?,
            redis_queue_key: get("REDIS_QUEUE_KEY")
                .unwrap_or_else(|| "grok_api_request_queue".into()),
            response_expiry_secs: parse_or(&get, "REDIS_RESPONSE_EXPIRY", 3600)?,

            prompt_token_cost_per_million: parse_or(&get, "PROMPT_TOKEN_COST_PER_MILLION", 2.00)?,
            completion_token_cost_per_million: parse_or(
                &get,
                "COMPLETION_TOKEN_COST_PER_MILLION",
                10.00,
            )?,

            enable_failover: parse_bool(&get, "ENABLE_FAILOVER", true),
            failover_providers: parse_list(get("FAILOVER_PROVIDERS").or(Some("openai".into()))),
            failover_threshold: parse_or(&get, "FAILOVER_THRESHOLD", 3)?,
            failover_recovery_secs: parse_or(&get, "FAILOVER_RECOVERY_TIME", 300)?,

            enable_health_checker: parse_bool(&get, "ENABLE_HEALTH_CHECKER", true),
            health_check_interval_secs: parse_or(&get, "HEALTH_CHECK_INTERVAL", 60)?,
            health_endpoints: health_endpoints(&get),

            enable_metrics: parse_bool(&get, "ENABLE_METRICS", true),
            metrics_window_hours: parse_or(&get, "METRICS_WINDOW_HOURS", 24)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.server_api_key.trim().is_empty() {
            return Err(ConfigError::MissingVar("SERVER_API_KEY"));
        }
        if !KNOWN_PROVIDERS.contains(&self.llm_provider.as_str()) {
            return Err(ConfigError::UnknownProvider(self.llm_provider.clone()));
        }
        for provider in &self.failover_providers {
            if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
                return Err(ConfigError::UnknownProvider(provider.clone()));
            }
        }
        if self.rate_limit_rps == 0 {
            return Err(ConfigError::InvalidVar {
                var: "RATE_LIMIT_RPS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Primary provider followed by the declared backups, primary first and
    /// without duplicates.
    #[must_use]
    pub fn all_providers(&self) -> Vec<String> {
        let mut providers = vec![self.llm_provider.clone()];
        for backup in &self.failover_providers {
            if !providers.contains(backup) {
                providers.push(backup.clone());
            }
        }
        providers
    }

    /// The default model bound to `provider`.
    #[must_use]
    pub fn default_model_for(&self, provider: &str) -> &str {
        match provider {
            "openai" => &self.openai_default_model,
            _ => &self.default_model,
        }
    }

    /// API key pool for `provider`.
    #[must_use]
    pub fn api_keys_for(&self, provider: &str) -> &[String] {
        match provider {
            "openai" => &self.openai_api_keys,
            "grok" => &self.grok_api_keys,
            _ => &[],
        }
    }

    #[must_use]
    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }

    #[must_use]
    pub fn response_expiry(&self) -> Duration {
        Duration::from_secs(self.response_expiry_secs)
    }

    #[must_use]
    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_hours * 3600)
    }
}

fn parse_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: bool) -> bool {
    match get(var) {
        Some(raw) => matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "t"),
        None => default,
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(raw) => raw.trim().parse().map_err(|err| ConfigError::InvalidVar {
            var,
            value: raw,
            reason: format!("{err}"),
        }),
        None => Ok(default),
    }
}

fn health_endpoints(get: &impl Fn(&str) -> Option<String>) -> HashMap<String, String> {
    let mut endpoints = HashMap::new();
    for (provider, var) in [
        ("grok", "GROK_HEALTH_ENDPOINT"),
        ("openai", "OPENAI_HEALTH_ENDPOINT"),
    ] {
        if let Some(url) = get(var).filter(|url| !url.trim().is_empty()) {
            endpoints.insert(provider.to_string(), url);
        }
    }
    endpoints
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn minimal_environment_uses_defaults() {
        let settings = Settings::from_lookup(lookup(&[("SERVER_API_KEY", "secret")])).unwrap();
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.llm_provider, "openai");
        assert_eq!(settings.rate_limit_rps, 7);
        assert_eq!(settings.failover_providers, vec!["openai".to_string()]);
        assert_eq!(settings.redis_queue_key, "grok_api_request_queue");
        assert!(settings.enable_failover);
    }

    #[test]
    fn missing_server_key_is_rejected() {
        let err = Settings::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("SERVER_API_KEY")));
    }

    #[test]
    fn key_pools_are_split_and_trimmed() {
        let settings = Settings::from_lookup(lookup(&[
            ("SERVER_API_KEY", "secret"),
            ("GROK_API_KEYS", "xai-1, xai-2 ,, xai-3"),
        ]))
        .unwrap();
        assert_eq!(settings.grok_api_keys, vec!["xai-1", "xai-2", "xai-3"]);
    }

    #[test]
    fn boolean_parsing_accepts_original_truthy_forms() {
        for truthy in ["true", "TRUE", "1", "t"] {
            let settings = Settings::from_lookup(lookup(&[
                ("SERVER_API_KEY", "secret"),
                ("ENABLE_FAILOVER", truthy),
            ]))
            .unwrap();
            assert!(settings.enable_failover, "{truthy} should parse as true");
        }
        let settings = Settings::from_lookup(lookup(&[
            ("SERVER_API_KEY", "secret"),
            ("ENABLE_FAILOVER", "no"),
        ]))
        .unwrap();
        assert!(!settings.enable_failover);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = Settings::from_lookup(lookup(&[
            ("SERVER_API_KEY", "secret"),
            ("LLM_PROVIDER", "anthropic"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(p) if p == "anthropic"));
    }

    #[test]
    fn all_providers_is_primary_first_and_deduplicated() {
        let settings = Settings::from_lookup(lookup(&[
            ("SERVER_API_KEY", "secret"),
            ("LLM_PROVIDER", "grok"),
            ("FAILOVER_PROVIDERS", "openai,grok"),
        ]))
        .unwrap();
        assert_eq!(settings.all_providers(), vec!["grok", "openai"]);
    }

    #[test]
    fn numeric_garbage_is_reported_with_the_variable_name() {
        let err = Settings::from_lookup(lookup(&[
            ("SERVER_API_KEY", "secret"),
            ("RATE_LIMIT_RPS", "several"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { var, .. } if var == "RATE_LIMIT_RPS"));
    }

    #[test]
    fn health_endpoints_collects_only_configured_providers() {
        let settings = Settings::from_lookup(lookup(&[
            ("SERVER_API_KEY", "secret"),
            ("GROK_HEALTH_ENDPOINT", "http://probe.local/health"),
        ]))
        .unwrap();
        assert_eq!(
            settings.health_endpoints.get("grok").map(String::as_str),
            Some("http://probe.local/health")
        );
        assert!(!settings.health_endpoints.contains_key("openai"));
    }
}
