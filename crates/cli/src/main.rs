//! switchyard — a queued LLM gateway with provider failover.
//!
//! Startup order: metrics pruner, health checker (initial sweep included),
//! dispatcher, then the HTTP listener. Shutdown reverses it after ctrl-c,
//! letting the dispatcher drain its in-flight item first.

use std::{net::SocketAddr, process::ExitCode, sync::Arc, time::Duration};

use {
    clap::Parser,
    tracing::{error, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    switchyard_config::Settings,
    switchyard_dispatch::{Dispatcher, DispatcherConfig, RateLimiter},
    switchyard_failover::{FailoverConfig, FailoverManager, HealthChecker},
    switchyard_gateway::AppState,
    switchyard_metrics::MetricsSink,
    switchyard_providers::{
        CostTable, KeyManager, OpenAiCompatProvider, ProviderRegistry, RetryPolicy,
    },
};

#[derive(Parser)]
#[command(name = "switchyard", about = "switchyard — queued LLM gateway with provider failover")]
struct Cli {
    /// Address to bind to (overrides HOST).
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    dotenvy::dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!(%err, "configuration is invalid");
            return ExitCode::FAILURE;
        }
    };

    match run(settings, &cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "gateway failed");
            ExitCode::FAILURE
        }
    }
}

fn build_registry(settings: &Settings) -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for provider in settings.all_providers() {
        match provider.as_str() {
            "grok" => registry.register(Arc::new(OpenAiCompatProvider::grok(
                &settings.grok_api_url,
                &settings.default_model,
            ))),
            "openai" => registry.register(Arc::new(OpenAiCompatProvider::openai(
                &settings.openai_api_url,
                &settings.openai_default_model,
            ))),
            other => anyhow::bail!("no adapter for provider {other:?}"),
        }
    }
    if registry.is_empty() {
        anyhow::bail!("no providers configured");
    }
    Ok(registry)
}

async fn run(mut settings: Settings, cli: &Cli) -> anyhow::Result<()> {
    if let Some(bind) = &cli.bind {
        settings.host = bind.clone();
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    let settings = Arc::new(settings);

    let registry = Arc::new(build_registry(&settings)?);
    let keys = Arc::new(KeyManager::new(
        settings.rate_limit_rps,
        settings
            .all_providers()
            .into_iter()
            .map(|p| (p.clone(), settings.api_keys_for(&p).to_vec())),
    ));
    let queue = switchyard_queue::connect(
        &settings.redis_url(),
        &settings.redis_queue_key,
        settings.response_expiry(),
    )
    .await;

    let backups: Vec<String> = settings.all_providers().into_iter().skip(1).collect();
    let failover = Arc::new(FailoverManager::new(FailoverConfig {
        primary: settings.llm_provider.clone(),
        backups: backups.clone(),
        threshold: settings.failover_threshold,
        recovery_time: Duration::from_secs(settings.failover_recovery_secs),
        enabled: settings.enable_failover,
    }));
    let metrics = Arc::new(MetricsSink::new(settings.metrics_window()));

    if settings.enable_metrics {
        metrics.start_pruner();
    }

    let health_checker = Arc::new(HealthChecker::new(
        Arc::clone(&failover),
        Arc::clone(&registry),
        Duration::from_secs(settings.health_check_interval_secs),
        settings.health_endpoints.clone(),
    ));
    if settings.enable_health_checker {
        health_checker.start().await;
    }

    let dispatcher = Dispatcher::new(DispatcherConfig {
        queue: Arc::clone(&queue),
        limiter: Arc::new(RateLimiter::new(settings.rate_limit_rps)),
        failover: Arc::clone(&failover),
        registry: Arc::clone(&registry),
        keys: Arc::clone(&keys),
        metrics: Arc::clone(&metrics),
        cost: CostTable::new(
            settings.prompt_token_cost_per_million,
            settings.completion_token_cost_per_million,
        ),
        retry_policy: RetryPolicy::new(
            settings.max_retries,
            Duration::from_secs(settings.base_retry_delay_secs),
        ),
        max_retries: backups.len() as u32 + 1,
    });
    let dispatcher_handle = Arc::clone(&dispatcher).start();

    let state = Arc::new(AppState {
        settings: Arc::clone(&settings),
        queue,
        keys,
        failover,
        metrics: Arc::clone(&metrics),
        registry,
    });
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    switchyard_gateway::serve(state, addr, shutdown_signal()).await?;

    // Reverse of the start order; the dispatcher finishes its in-flight
    // item before the background services go down.
    dispatcher.shutdown().await;
    dispatcher_handle.await.ok();
    if settings.enable_health_checker {
        health_checker.stop().await;
    }
    if settings.enable_metrics {
        metrics.stop().await;
    }

    info!("clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
