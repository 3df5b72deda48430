use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    metrics::{counter, histogram},
    serde::Serialize,
    tokio::{task::JoinHandle, time::sleep},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::names;

/// Cadence of the background pruner.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// One dispatched request, completed in place when its terminal arrives.
#[derive(Debug, Clone)]
struct RequestRecord {
    request_id: String,
    provider: String,
    model: String,
    ts_ms: u64,
    completed: bool,
    success: Option<bool>,
    duration_secs: Option<f64>,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    cost: Option<f64>,
}

struct PrunerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct MetricsSink {
    records: Arc<Mutex<Vec<RequestRecord>>>,
    window: Duration,
    pruner: Mutex<Option<PrunerTask>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl MetricsSink {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            window,
            pruner: Mutex::new(None),
        }
    }

    /// Record the start of a dispatch.
    pub fn record_request(&self, provider: &str, request_id: &str, model: &str, messages: usize) {
        counter!(names::LLM_REQUESTS_TOTAL, "provider" => provider.to_string()).increment(1);
        lock(&self.records).push(RequestRecord {
            request_id: request_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            ts_ms: now_ms(),
            completed: false,
            success: None,
            duration_secs: None,
            prompt_tokens: None,
            completion_tokens: None,
            cost: None,
        });
        debug!(provider, request_id, messages, "recorded request start");
    }

    /// Record the terminal outcome of a dispatch. The first terminal for a
    /// given id wins; later calls find no open record and are dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn record_response(
        &self,
        provider: &str,
        request_id: &str,
        success: bool,
        duration: Duration,
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
        cost: Option<f64>,
    ) {
        let label = provider.to_string();
        if success {
            counter!(names::LLM_COMPLETIONS_TOTAL, "provider" => label.clone()).increment(1);
        } else {
            counter!(names::LLM_ERRORS_TOTAL, "provider" => label.clone()).increment(1);
        }
        if let Some(tokens) = prompt_tokens {
            counter!(names::LLM_PROMPT_TOKENS_TOTAL, "provider" => label.clone())
                .increment(tokens);
        }
        if let Some(tokens) = completion_tokens {
            counter!(names::LLM_COMPLETION_TOKENS_TOTAL, "provider" => label.clone())
                .increment(tokens);
        }
        histogram!(names::LLM_DURATION_SECONDS, "provider" => label).record(duration.as_secs_f64());

        let mut records = lock(&self.records);
        match records
            .iter_mut()
            .find(|r| r.request_id == request_id && !r.completed)
        {
            Some(record) => {
                record.completed = true;
                record.success = Some(success);
                record.duration_secs = Some(duration.as_secs_f64());
                record.prompt_tokens = prompt_tokens;
                record.completion_tokens = completion_tokens;
                record.cost = cost;
            }
            None => warn!(provider, request_id, "response without an open request record"),
        }
    }

    /// Drop records older than the retention window.
    pub fn prune(&self) {
        prune_records(&self.records, self.window);
    }

    /// Start the hourly pruner. A second call is a no-op.
    pub fn start_pruner(&self) {
        let mut pruner = lock(&self.pruner);
        if pruner.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let records = Arc::clone(&self.records);
        let window = self.window;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    () = sleep(PRUNE_INTERVAL) => prune_records(&records, window),
                }
            }
        });
        *pruner = Some(PrunerTask { cancel, handle });
        info!("metrics pruner started");
    }

    /// Stop the pruner and wait for it to exit.
    pub async fn stop(&self) {
        let task = lock(&self.pruner).take();
        if let Some(task) = task {
            task.cancel.cancel();
            if task.handle.await.is_err() {
                warn!("metrics pruner did not shut down cleanly");
            }
            info!("metrics pruner stopped");
        }
    }

    /// Aggregated report. With a provider filter only that provider's
    /// section is produced; without one the aggregate view additionally
    /// carries provider usage and failover events.
    #[must_use]
    pub fn report(&self, provider: Option<&str>, window: Option<Duration>) -> MetricsReport {
        let cutoff = now_ms().saturating_sub(window.unwrap_or(self.window).as_millis() as u64);
        let records = lock(&self.records);
        let in_window: Vec<&RequestRecord> =
            records.iter().filter(|r| r.ts_ms > cutoff).collect();

        let mut providers = BTreeMap::new();
        match provider {
            Some(name) => {
                let logs: Vec<&RequestRecord> = in_window
                    .iter()
                    .copied()
                    .filter(|r| r.provider == name)
                    .collect();
                providers.insert(name.to_string(), summarize(&logs));
                MetricsReport {
                    overall: None,
                    providers,
                }
            }
            None => {
                let mut provider_names: Vec<&str> =
                    in_window.iter().map(|r| r.provider.as_str()).collect();
                provider_names.sort_unstable();
                provider_names.dedup();
                for name in provider_names {
                    let logs: Vec<&RequestRecord> = in_window
                        .iter()
                        .copied()
                        .filter(|r| r.provider == name)
                        .collect();
                    providers.insert(name.to_string(), summarize(&logs));
                }
                MetricsReport {
                    overall: Some(overall(&in_window)),
                    providers,
                }
            }
        }
    }

    /// Flat usage totals for the `/stats` endpoint.
    #[must_use]
    pub fn usage_stats(&self, provider: Option<&str>) -> UsageStats {
        let records = lock(&self.records);
        let selected: Vec<&RequestRecord> = records
            .iter()
            .filter(|r| provider.is_none_or(|p| r.provider == p))
            .collect();

        let minute_ago = now_ms().saturating_sub(60_000);
        let recent = selected.iter().filter(|r| r.ts_ms > minute_ago).count();

        UsageStats {
            total_requests: selected.len() as u64,
            total_prompt_tokens: selected.iter().filter_map(|r| r.prompt_tokens).sum(),
            total_completion_tokens: selected.iter().filter_map(|r| r.completion_tokens).sum(),
            total_cost: selected.iter().filter_map(|r| r.cost).sum(),
            requests_per_second: recent as f64 / 60.0,
            failed_requests: selected
                .iter()
                .filter(|r| r.success == Some(false))
                .count() as u64,
        }
    }

    #[cfg(test)]
    fn backdate(&self, request_id: &str, ts_ms: u64) {
        let mut records = lock(&self.records);
        if let Some(record) = records.iter_mut().find(|r| r.request_id == request_id) {
            record.ts_ms = ts_ms;
        }
    }
}

// ── Report shapes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ProviderMetrics {
    pub request_count: u64,
    pub completed_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Percentage of completed requests that succeeded.
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub model_usage: BTreeMap<String, u64>,
    pub hourly_requests: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverEvent {
    pub timestamp_ms: u64,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallMetrics {
    #[serde(flatten)]
    pub summary: ProviderMetrics,
    pub provider_usage: BTreeMap<String, u64>,
    pub failover_events: Vec<FailoverEvent>,
    pub failover_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall: Option<OverallMetrics>,
    pub providers: BTreeMap<String, ProviderMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub total_requests: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_cost: f64,
    pub requests_per_second: f64,
    pub failed_requests: u64,
}

fn summarize(records: &[&RequestRecord]) -> ProviderMetrics {
    let completed: Vec<&&RequestRecord> = records.iter().filter(|r| r.completed).collect();
    let success_count = completed
        .iter()
        .filter(|r| r.success == Some(true))
        .count() as u64;
    let completed_count = completed.len() as u64;

    let durations: Vec<f64> = completed.iter().filter_map(|r| r.duration_secs).collect();
    let avg_response_time = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };

    let total_prompt_tokens: u64 = records.iter().filter_map(|r| r.prompt_tokens).sum();
    let total_completion_tokens: u64 = records.iter().filter_map(|r| r.completion_tokens).sum();

    let mut model_usage = BTreeMap::new();
    let mut hourly_requests = BTreeMap::new();
    for record in records {
        *model_usage.entry(record.model.clone()).or_default() += 1;
        *hourly_requests.entry(hour_label(record.ts_ms)).or_default() += 1;
    }

    ProviderMetrics {
        request_count: records.len() as u64,
        completed_count,
        success_count,
        failure_count: completed_count - success_count,
        success_rate: if completed_count > 0 {
            round2(success_count as f64 / completed_count as f64 * 100.0)
        } else {
            0.0
        },
        avg_response_time: round2(avg_response_time),
        total_prompt_tokens,
        total_completion_tokens,
        total_tokens: total_prompt_tokens + total_completion_tokens,
        total_cost: records.iter().filter_map(|r| r.cost).sum(),
        model_usage,
        hourly_requests,
    }
}

fn overall(in_window: &[&RequestRecord]) -> OverallMetrics {
    let summary = summarize(in_window);

    let mut provider_usage: BTreeMap<String, u64> = BTreeMap::new();
    for record in in_window {
        *provider_usage.entry(record.provider.clone()).or_default() += 1;
    }

    // Failover events are visible in the log as adjacent records carried by
    // different providers.
    let mut sorted: Vec<&RequestRecord> = in_window.to_vec();
    sorted.sort_by_key(|r| r.ts_ms);
    let mut failover_events = Vec::new();
    let mut last_provider: Option<&str> = None;
    for record in sorted {
        if let Some(last) = last_provider
            && last != record.provider
        {
            failover_events.push(FailoverEvent {
                timestamp_ms: record.ts_ms,
                from: last.to_string(),
                to: record.provider.clone(),
            });
        }
        last_provider = Some(&record.provider);
    }

    OverallMetrics {
        summary,
        provider_usage,
        failover_count: failover_events.len() as u64,
        failover_events,
    }
}

fn prune_records(records: &Mutex<Vec<RequestRecord>>, window: Duration) {
    let cutoff = now_ms().saturating_sub(window.as_millis() as u64);
    let mut records = lock(records);
    let before = records.len();
    records.retain(|r| r.ts_ms > cutoff);
    let dropped = before - records.len();
    if dropped > 0 {
        debug!(dropped, "pruned aged-out metric records");
    }
}

fn hour_label(ts_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:00").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> MetricsSink {
        MetricsSink::new(Duration::from_secs(24 * 3600))
    }

    fn complete(sink: &MetricsSink, provider: &str, id: &str, success: bool, secs: f64) {
        sink.record_request(provider, id, "grok-3-mini", 2);
        sink.record_response(
            provider,
            id,
            success,
            Duration::from_secs_f64(secs),
            Some(100),
            Some(50),
            Some(0.001),
        );
    }

    #[test]
    fn provider_report_computes_rates_and_sums() {
        let sink = sink();
        complete(&sink, "grok", "r1", true, 1.0);
        complete(&sink, "grok", "r2", true, 3.0);
        complete(&sink, "grok", "r3", false, 2.0);

        let report = sink.report(Some("grok"), None);
        let grok = &report.providers["grok"];
        assert_eq!(grok.request_count, 3);
        assert_eq!(grok.completed_count, 3);
        assert_eq!(grok.success_count, 2);
        assert_eq!(grok.failure_count, 1);
        assert!((grok.success_rate - 66.67).abs() < 0.01);
        assert!((grok.avg_response_time - 2.0).abs() < 1e-9);
        assert_eq!(grok.total_prompt_tokens, 300);
        assert_eq!(grok.total_tokens, 450);
        assert_eq!(grok.model_usage["grok-3-mini"], 3);
        assert!(report.overall.is_none());
    }

    #[test]
    fn open_requests_count_but_do_not_complete() {
        let sink = sink();
        sink.record_request("grok", "r1", "grok-3-mini", 1);

        let report = sink.report(Some("grok"), None);
        let grok = &report.providers["grok"];
        assert_eq!(grok.request_count, 1);
        assert_eq!(grok.completed_count, 0);
        assert_eq!(grok.success_rate, 0.0);
    }

    #[test]
    fn second_terminal_for_an_id_is_ignored() {
        let sink = sink();
        complete(&sink, "grok", "r1", true, 1.0);
        // Late duplicate publish.
        sink.record_response("grok", "r1", false, Duration::from_secs(9), None, None, None);

        let report = sink.report(Some("grok"), None);
        let grok = &report.providers["grok"];
        assert_eq!(grok.success_count, 1);
        assert_eq!(grok.failure_count, 0);
    }

    #[test]
    fn aggregate_view_scans_failover_events() {
        let sink = sink();
        complete(&sink, "grok", "r1", true, 1.0);
        complete(&sink, "grok", "r2", false, 1.0);
        complete(&sink, "openai", "r3", true, 1.0);
        complete(&sink, "grok", "r4", true, 1.0);

        // Force a strict ordering so the scan is deterministic.
        sink.backdate("r1", 1_000);
        sink.backdate("r2", 2_000);
        sink.backdate("r3", 3_000);
        sink.backdate("r4", 4_000);

        let report = sink.report(None, None);
        let overall = report.overall.unwrap();
        assert_eq!(overall.failover_count, 2);
        assert_eq!(overall.failover_events[0].from, "grok");
        assert_eq!(overall.failover_events[0].to, "openai");
        assert_eq!(overall.failover_events[1].from, "openai");
        assert_eq!(overall.failover_events[1].to, "grok");
        assert_eq!(overall.provider_usage["grok"], 3);
    }

    #[test]
    fn window_filter_excludes_old_records() {
        let sink = sink();
        complete(&sink, "grok", "old", true, 1.0);
        complete(&sink, "grok", "new", true, 1.0);
        sink.backdate("old", now_ms() - 7_200_000);

        let report = sink.report(Some("grok"), Some(Duration::from_secs(3600)));
        assert_eq!(report.providers["grok"].request_count, 1);
    }

    #[test]
    fn prune_drops_records_outside_the_retention_window() {
        let sink = MetricsSink::new(Duration::from_secs(3600));
        complete(&sink, "grok", "old", true, 1.0);
        complete(&sink, "grok", "new", true, 1.0);
        sink.backdate("old", now_ms() - 7_200_000);

        sink.prune();
        let report = sink.report(Some("grok"), None);
        assert_eq!(report.providers["grok"].request_count, 1);
    }

    #[test]
    fn usage_stats_sum_across_providers() {
        let sink = sink();
        complete(&sink, "grok", "r1", true, 1.0);
        complete(&sink, "openai", "r2", false, 1.0);

        let all = sink.usage_stats(None);
        assert_eq!(all.total_requests, 2);
        assert_eq!(all.failed_requests, 1);
        assert_eq!(all.total_prompt_tokens, 200);
        assert!(all.requests_per_second > 0.0);

        let grok = sink.usage_stats(Some("grok"));
        assert_eq!(grok.total_requests, 1);
        assert_eq!(grok.failed_requests, 0);
    }

    #[tokio::test]
    async fn pruner_starts_and_stops_cleanly() {
        let sink = MetricsSink::new(Duration::from_secs(3600));
        sink.start_pruner();
        sink.start_pruner(); // second call is a no-op
        sink.stop().await;
    }
}
