//! The failover state machine.
//!
//! Two states: NORMAL (current provider is the configured primary) and
//! FAILOVER (current provider is a backup). One async mutex guards the
//! current provider, the failover flag, and every per-provider status; all
//! acquisitions are deadlined so a stuck probe can never deadlock callers.
//! A lock-free shadow of the current provider name serves the timeout
//! fallback paths.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use {
    serde::Serialize,
    thiserror::Error,
    tokio::{
        sync::{Mutex, MutexGuard},
        time::{Instant, timeout},
    },
    tracing::{error, info, warn},
};

use switchyard_providers::{ChatProvider, ProviderRegistry};

/// Total budget for provider selection, probe included.
const SELECT_DEADLINE: Duration = Duration::from_secs(3);
/// Budget for acquiring the state lock.
const LOCK_DEADLINE: Duration = Duration::from_secs(2);
/// Outcome reports give up on the lock sooner; dropping one report is
/// cheaper than stalling the dispatcher.
const REPORT_LOCK_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("unknown provider {0:?}")]
    UnknownProvider(String),

    #[error("failover state lock is busy")]
    LockTimeout,
}

/// Constructor knobs, lifted straight from the settings.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub primary: String,
    pub backups: Vec<String>,
    pub threshold: u32,
    pub recovery_time: Duration,
    pub enabled: bool,
}

struct ProviderState {
    available: bool,
    failure_count: u32,
    last_check: Instant,
    last_check_ms: u64,
}

impl ProviderState {
    fn new() -> Self {
        Self {
            available: true,
            failure_count: 0,
            last_check: Instant::now(),
            last_check_ms: switchyard_common::unix_ms(),
        }
    }

    fn touch(&mut self) {
        self.last_check = Instant::now();
        self.last_check_ms = switchyard_common::unix_ms();
    }
}

struct Inner {
    current: String,
    in_failover_mode: bool,
    states: HashMap<String, ProviderState>,
}

pub struct FailoverManager {
    primary: String,
    backups: Vec<String>,
    threshold: u32,
    recovery_time: Duration,
    enabled: bool,
    inner: Mutex<Inner>,
    /// Lock-free copy of `Inner::current` for deadline fallback paths.
    current_shadow: RwLock<String>,
}

impl FailoverManager {
    #[must_use]
    pub fn new(config: FailoverConfig) -> Self {
        let mut states = HashMap::new();
        states.insert(config.primary.clone(), ProviderState::new());
        for backup in &config.backups {
            states
                .entry(backup.clone())
                .or_insert_with(ProviderState::new);
        }
        info!(
            primary = config.primary,
            backups = ?config.backups,
            threshold = config.threshold,
            "failover manager initialized"
        );
        Self {
            current_shadow: RwLock::new(config.primary.clone()),
            inner: Mutex::new(Inner {
                current: config.primary.clone(),
                in_failover_mode: false,
                states,
            }),
            primary: config.primary,
            backups: config.backups,
            threshold: config.threshold.max(1),
            recovery_time: config.recovery_time,
            enabled: config.enabled,
        }
    }

    /// Primary first, then backups in declared order.
    #[must_use]
    pub fn all_providers(&self) -> Vec<String> {
        let mut providers = vec![self.primary.clone()];
        for backup in &self.backups {
            if !providers.contains(backup) {
                providers.push(backup.clone());
            }
        }
        providers
    }

    #[must_use]
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Current provider name without touching the async lock.
    #[must_use]
    pub fn current_provider(&self) -> String {
        self.current_shadow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_shadow(&self, provider: &str) {
        *self
            .current_shadow
            .write()
            .unwrap_or_else(PoisonError::into_inner) = provider.to_string();
    }

    async fn lock(&self, deadline: Duration) -> Option<MutexGuard<'_, Inner>> {
        match timeout(deadline, self.inner.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => None,
        }
    }

    // ── Selection ────────────────────────────────────────────────────────────

    /// The adapter to dispatch with right now.
    ///
    /// In FAILOVER mode, when the primary has gone unprobed past the
    /// recovery time, a recovery probe runs first — without holding the
    /// state lock for its duration. Lock or budget timeouts fall back to
    /// the shadow current without mutating state.
    pub async fn current_adapter(
        &self,
        registry: &ProviderRegistry,
    ) -> Option<Arc<dyn ChatProvider>> {
        match timeout(SELECT_DEADLINE, self.select(registry)).await {
            Ok(adapter) => adapter,
            Err(_) => {
                warn!("provider selection timed out, using current provider as-is");
                self.fallback_adapter(registry)
            }
        }
    }

    async fn select(&self, registry: &ProviderRegistry) -> Option<Arc<dyn ChatProvider>> {
        let Some(mut guard) = self.lock(LOCK_DEADLINE).await else {
            warn!("failover lock busy, skipping recovery check");
            return self.fallback_adapter(registry);
        };

        let probe_primary = guard.in_failover_mode
            && guard.states.get(&self.primary).is_some_and(|state| {
                !state.available && state.last_check.elapsed() > self.recovery_time
            });

        if probe_primary {
            // Stamp the probe time while still locked so concurrent
            // selections do not pile onto the same recovery probe.
            if let Some(state) = guard.states.get_mut(&self.primary) {
                state.touch();
            }
            drop(guard);

            let healthy = match registry.get(&self.primary) {
                Some(adapter) => adapter.health_check().await,
                None => false,
            };
            info!(provider = self.primary, healthy, "recovery probe finished");
            self.apply_probe_result(&self.primary, healthy).await;
        } else {
            drop(guard);
        }

        let current = match self.lock(LOCK_DEADLINE).await {
            Some(guard) => guard.current.clone(),
            None => self.current_provider(),
        };
        registry
            .get(&current)
            .or_else(|| self.fallback_adapter(registry))
    }

    fn fallback_adapter(&self, registry: &ProviderRegistry) -> Option<Arc<dyn ChatProvider>> {
        let current = self.current_provider();
        registry
            .get(&current)
            .or_else(|| registry.get(&self.primary))
            .or_else(|| registry.any())
    }

    // ── Outcome reporting ────────────────────────────────────────────────────

    /// An upstream call through `provider` succeeded.
    pub async fn report_success(&self, provider: &str) {
        let Some(mut guard) = self.lock(LOCK_DEADLINE).await else {
            warn!(provider, "dropping success report, failover lock busy");
            return;
        };
        let Some(state) = guard.states.get_mut(provider) else {
            return;
        };

        state.failure_count = 0;
        if !state.available {
            state.available = true;
            info!(provider, "provider is available again");
            if provider == self.primary && guard.in_failover_mode {
                self.enter_normal(&mut guard);
            }
        }
    }

    /// An upstream call through `provider` failed.
    pub async fn report_failure(&self, provider: &str) {
        if !self.enabled {
            return;
        }
        let Some(mut guard) = self.lock(REPORT_LOCK_DEADLINE).await else {
            warn!(provider, "dropping failure report, failover lock busy");
            return;
        };
        let Some(state) = guard.states.get_mut(provider) else {
            warn!(provider, "failure reported for unknown provider");
            return;
        };

        state.failure_count += 1;
        warn!(
            provider,
            failures = state.failure_count,
            threshold = self.threshold,
            "provider failure reported"
        );

        if state.failure_count >= self.threshold {
            state.available = false;
            state.touch();
            warn!(provider, "provider marked unavailable");
            if guard.current == provider {
                self.rotate_locked(&mut guard);
            }
        }
    }

    /// Probe outcome from the health checker (or a recovery probe).
    ///
    /// Pass: the provider becomes available, counters reset, and a
    /// recovered primary ends FAILOVER mode. Fail: counters climb and the
    /// provider goes unavailable at the threshold, rotating if it was
    /// current.
    pub async fn apply_probe_result(&self, provider: &str, healthy: bool) {
        let Some(mut guard) = self.lock(LOCK_DEADLINE).await else {
            warn!(provider, "dropping probe result, failover lock busy");
            return;
        };
        let Some(state) = guard.states.get_mut(provider) else {
            return;
        };
        state.touch();

        if healthy {
            if !state.available {
                info!(provider, "health probe passed, provider recovered");
            }
            state.available = true;
            state.failure_count = 0;
            if provider == self.primary && guard.in_failover_mode {
                self.enter_normal(&mut guard);
            }
        } else if state.available {
            state.failure_count += 1;
            if state.failure_count >= self.threshold {
                state.available = false;
                warn!(provider, "health probes reached threshold, provider unavailable");
                if guard.current == provider {
                    self.rotate_locked(&mut guard);
                }
            }
        }
    }

    /// Startup-sweep outcome: availability is set directly, without the
    /// threshold gate, so the gateway never starts dispatching to a
    /// provider that failed its first probe.
    pub async fn apply_sweep_result(&self, provider: &str, healthy: bool) {
        let Some(mut guard) = self.lock(LOCK_DEADLINE).await else {
            warn!(provider, "dropping sweep result, failover lock busy");
            return;
        };
        let Some(state) = guard.states.get_mut(provider) else {
            return;
        };
        state.touch();
        if healthy {
            state.available = true;
            state.failure_count = 0;
        } else {
            state.available = false;
            state.failure_count += 1;
        }
    }

    /// Rotate away from the primary if its sweep marked it down.
    pub async fn rotate_if_primary_unavailable(&self) {
        let Some(mut guard) = self.lock(LOCK_DEADLINE).await else {
            return;
        };
        let primary_down = guard
            .states
            .get(&self.primary)
            .is_some_and(|state| !state.available);
        if primary_down {
            warn!(primary = self.primary, "primary failed its initial sweep");
            self.rotate_locked(&mut guard);
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    #[must_use]
    pub async fn is_available(&self, provider: &str) -> bool {
        match self.lock(LOCK_DEADLINE).await {
            Some(guard) => guard
                .states
                .get(provider)
                .is_some_and(|state| state.available),
            None => false,
        }
    }

    /// First provider (primary-first order) that is available and not in
    /// `exclude`. The dispatcher uses this to rebind retried items.
    pub async fn first_available_excluding(&self, exclude: &[String]) -> Option<String> {
        let guard = self.lock(LOCK_DEADLINE).await?;
        self.all_providers().into_iter().find(|provider| {
            !exclude.contains(provider)
                && guard
                    .states
                    .get(provider)
                    .is_some_and(|state| state.available)
        })
    }

    /// Read-only snapshot for the health checker.
    pub async fn probe_snapshot(&self) -> Vec<ProbeTarget> {
        match self.lock(LOCK_DEADLINE).await {
            Some(guard) => self
                .all_providers()
                .into_iter()
                .filter_map(|provider| {
                    guard.states.get(&provider).map(|state| ProbeTarget {
                        available: state.available,
                        since_last_check: state.last_check.elapsed(),
                        provider,
                    })
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Status snapshot for the HTTP surface.
    pub async fn status(&self) -> FailoverStatus {
        let Some(guard) = self.lock(LOCK_DEADLINE).await else {
            // Best effort under contention: identity without per-provider
            // detail.
            return FailoverStatus {
                current_provider: self.current_provider(),
                primary_provider: self.primary.clone(),
                failover_providers: self.backups.clone(),
                in_failover_mode: self.current_provider() != self.primary,
                provider_statuses: BTreeMap::new(),
            };
        };
        FailoverStatus {
            current_provider: guard.current.clone(),
            primary_provider: self.primary.clone(),
            failover_providers: self.backups.clone(),
            in_failover_mode: guard.in_failover_mode,
            provider_statuses: guard
                .states
                .iter()
                .map(|(provider, state)| {
                    (
                        provider.clone(),
                        ProviderStatus {
                            available: state.available,
                            failure_count: state.failure_count,
                            last_check: format_check_time(state.last_check_ms),
                        },
                    )
                })
                .collect(),
        }
    }

    // ── Manual operations ────────────────────────────────────────────────────

    /// Force the current provider, entering or leaving FAILOVER mode as the
    /// invariant requires.
    pub async fn force_switch(&self, provider: &str) -> Result<ForceSwitchOutcome, FailoverError> {
        let mut guard = self
            .lock(LOCK_DEADLINE)
            .await
            .ok_or(FailoverError::LockTimeout)?;
        if !guard.states.contains_key(provider) {
            return Err(FailoverError::UnknownProvider(provider.to_string()));
        }

        let previous = guard.current.clone();
        guard.current = provider.to_string();
        guard.in_failover_mode = provider != self.primary;
        self.set_shadow(provider);
        warn!(from = previous, to = provider, "manual failover switch");
        Ok(ForceSwitchOutcome {
            previous_provider: previous,
            current_provider: provider.to_string(),
        })
    }

    /// Clear a provider's failure state.
    pub async fn reset_provider(&self, provider: &str) -> Result<ProviderStatus, FailoverError> {
        let mut guard = self
            .lock(LOCK_DEADLINE)
            .await
            .ok_or(FailoverError::LockTimeout)?;
        let Some(state) = guard.states.get_mut(provider) else {
            return Err(FailoverError::UnknownProvider(provider.to_string()));
        };
        state.available = true;
        state.failure_count = 0;
        state.touch();
        info!(provider, "provider state manually reset");
        Ok(ProviderStatus {
            available: true,
            failure_count: 0,
            last_check: format_check_time(state.last_check_ms),
        })
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn enter_normal(&self, guard: &mut MutexGuard<'_, Inner>) {
        guard.current = self.primary.clone();
        guard.in_failover_mode = false;
        self.set_shadow(&self.primary);
        info!(primary = self.primary, "switching back to primary provider");
    }

    /// Pick the next provider: primary when available, else the first
    /// available backup, else stay on primary and wait for a probe.
    fn rotate_locked(&self, guard: &mut MutexGuard<'_, Inner>) {
        let primary_available = guard
            .states
            .get(&self.primary)
            .is_some_and(|state| state.available);
        if primary_available {
            if guard.current != self.primary {
                self.enter_normal(guard);
            }
            return;
        }

        for backup in &self.backups {
            let available = guard
                .states
                .get(backup)
                .is_some_and(|state| state.available);
            if available {
                guard.current = backup.clone();
                guard.in_failover_mode = true;
                self.set_shadow(backup);
                warn!(provider = backup, "switching to backup provider");
                return;
            }
        }

        error!("no provider available, staying on primary");
        guard.current = self.primary.clone();
        guard.in_failover_mode = false;
        self.set_shadow(&self.primary);
    }
}

// ── Snapshots ────────────────────────────────────────────────────────────────

/// One provider as seen by the health checker.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub provider: String,
    pub available: bool,
    pub since_last_check: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub available: bool,
    pub failure_count: u32,
    pub last_check: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverStatus {
    pub current_provider: String,
    pub primary_provider: String,
    pub failover_providers: Vec<String>,
    pub in_failover_mode: bool,
    pub provider_statuses: BTreeMap<String, ProviderStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForceSwitchOutcome {
    pub previous_provider: String,
    pub current_provider: String,
}

fn format_check_time(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn manager(threshold: u32, enabled: bool) -> FailoverManager {
        FailoverManager::new(FailoverConfig {
            primary: "grok".into(),
            backups: vec!["openai".into()],
            threshold,
            recovery_time: Duration::from_secs(300),
            enabled,
        })
    }

    async fn assert_invariant(manager: &FailoverManager) {
        let status = manager.status().await;
        assert_eq!(
            status.in_failover_mode,
            status.current_provider != status.primary_provider,
            "current != primary must imply failover mode and vice versa"
        );
    }

    #[tokio::test]
    async fn starts_normal_on_the_primary() {
        let m = manager(3, true);
        let status = m.status().await;
        assert_eq!(status.current_provider, "grok");
        assert!(!status.in_failover_mode);
        assert!(status.provider_statuses["grok"].available);
        assert_invariant(&m).await;
    }

    #[tokio::test]
    async fn threshold_failures_rotate_to_the_backup() {
        let m = manager(3, true);
        m.report_failure("grok").await;
        m.report_failure("grok").await;
        assert!(m.is_available("grok").await);

        m.report_failure("grok").await;
        let status = m.status().await;
        assert!(!status.provider_statuses["grok"].available);
        assert_eq!(status.current_provider, "openai");
        assert!(status.in_failover_mode);
        assert_invariant(&m).await;
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let m = manager(3, true);
        m.report_failure("grok").await;
        m.report_failure("grok").await;
        m.report_success("grok").await;
        m.report_failure("grok").await;
        m.report_failure("grok").await;

        // Two failures after the reset: still under the threshold.
        assert!(m.is_available("grok").await);
        assert_invariant(&m).await;
    }

    #[tokio::test]
    async fn primary_success_after_recovery_ends_failover_mode() {
        let m = manager(1, true);
        m.report_failure("grok").await;
        assert_eq!(m.current_provider(), "openai");

        m.report_success("grok").await;
        let status = m.status().await;
        assert_eq!(status.current_provider, "grok");
        assert!(!status.in_failover_mode);
        assert!(status.provider_statuses["grok"].available);
        assert_invariant(&m).await;
    }

    #[tokio::test]
    async fn probe_pass_on_the_primary_ends_failover_mode() {
        let m = manager(1, true);
        m.report_failure("grok").await;
        assert!(m.status().await.in_failover_mode);

        m.apply_probe_result("grok", true).await;
        let status = m.status().await;
        assert_eq!(status.current_provider, "grok");
        assert!(!status.in_failover_mode);
        assert_invariant(&m).await;
    }

    #[tokio::test]
    async fn probe_failures_are_threshold_gated() {
        let m = manager(3, true);
        m.apply_probe_result("grok", false).await;
        m.apply_probe_result("grok", false).await;
        assert!(m.is_available("grok").await);

        m.apply_probe_result("grok", false).await;
        assert!(!m.is_available("grok").await);
        assert_eq!(m.current_provider(), "openai");
        assert_invariant(&m).await;
    }

    #[tokio::test]
    async fn sweep_results_set_availability_directly() {
        let m = manager(3, true);
        m.apply_sweep_result("grok", false).await;
        assert!(!m.is_available("grok").await);

        m.rotate_if_primary_unavailable().await;
        assert_eq!(m.current_provider(), "openai");
        assert_invariant(&m).await;
    }

    #[tokio::test]
    async fn no_available_provider_stays_on_primary() {
        let m = manager(1, true);
        m.apply_sweep_result("openai", false).await;
        m.report_failure("grok").await;

        let status = m.status().await;
        assert_eq!(status.current_provider, "grok");
        assert!(!status.in_failover_mode);
        assert_invariant(&m).await;
    }

    #[tokio::test]
    async fn disabled_failover_ignores_failure_reports() {
        let m = manager(1, false);
        m.report_failure("grok").await;
        assert!(m.is_available("grok").await);
        assert_eq!(m.current_provider(), "grok");
    }

    #[tokio::test]
    async fn force_switch_updates_mode_and_rejects_unknown_providers() {
        let m = manager(3, true);
        let outcome = m.force_switch("openai").await.unwrap();
        assert_eq!(outcome.previous_provider, "grok");
        assert_eq!(outcome.current_provider, "openai");
        assert!(m.status().await.in_failover_mode);
        assert_invariant(&m).await;

        let back = m.force_switch("grok").await.unwrap();
        assert_eq!(back.previous_provider, "openai");
        assert!(!m.status().await.in_failover_mode);

        assert!(matches!(
            m.force_switch("anthropic").await,
            Err(FailoverError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn reset_provider_clears_failures() {
        let m = manager(1, true);
        m.report_failure("openai").await;
        assert!(!m.is_available("openai").await);

        let status = m.reset_provider("openai").await.unwrap();
        assert!(status.available);
        assert_eq!(status.failure_count, 0);
        assert!(m.is_available("openai").await);
    }

    #[tokio::test]
    async fn first_available_excluding_respects_order_and_state() {
        let m = manager(1, true);
        assert_eq!(
            m.first_available_excluding(&[]).await.as_deref(),
            Some("grok")
        );
        assert_eq!(
            m.first_available_excluding(&["grok".into()]).await.as_deref(),
            Some("openai")
        );

        m.report_failure("openai").await;
        assert_eq!(m.first_available_excluding(&["grok".into()]).await, None);
    }
}
