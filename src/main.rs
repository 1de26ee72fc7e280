use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ensemble_gateway::build_router;
use ensemble_gateway::config::{Args, GatewayConfig};
use ensemble_gateway::orchestrator::Orchestrator;
use ensemble_gateway::provider::OpenRouterProvider;
use ensemble_gateway::rate_limit::{RateLimiter, TokenBucketLimiter, bucket_sweeper};
use ensemble_gateway::session_lock::{InMemorySessionLock, SessionLock};
use ensemble_gateway::state::AppState;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(feature = "redis")]
async fn stores(
    config: &GatewayConfig,
) -> Result<(Arc<dyn RateLimiter>, Arc<dyn SessionLock>), Box<dyn std::error::Error>> {
    use ensemble_gateway::redis_store::{RedisRateLimiter, RedisSessionLock, connect};

    if let Some(url) = &config.redis_url {
        let client = connect(url).await?;
        tracing::info!("using redis for rate limits and session locks");
        return Ok((
            Arc::new(RedisRateLimiter::new(client.clone(), config.rate)),
            Arc::new(RedisSessionLock::new(client)),
        ));
    }
    Ok(in_memory_stores(config))
}

#[cfg(not(feature = "redis"))]
async fn stores(
    config: &GatewayConfig,
) -> Result<(Arc<dyn RateLimiter>, Arc<dyn SessionLock>), Box<dyn std::error::Error>> {
    Ok(in_memory_stores(config))
}

fn in_memory_stores(config: &GatewayConfig) -> (Arc<dyn RateLimiter>, Arc<dyn SessionLock>) {
    (
        Arc::new(TokenBucketLimiter::new(config.rate)),
        Arc::new(InMemorySessionLock::new()),
    )
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let config = Arc::new(GatewayConfig::try_from(args)?);
    init_tracing(config.log_json);

    if config.api_key.is_none() {
        tracing::warn!("no server API key configured, requests must bring their own");
    }

    let provider = Arc::new(OpenRouterProvider::new(config.provider_url.clone())?);
    let (limiter, locks) = stores(&config).await?;

    // spawn the background sweeper
    tokio::spawn(bucket_sweeper(Arc::clone(&limiter), config.sweep_interval));

    let orchestrator = Arc::new(Orchestrator::new(
        provider,
        limiter,
        locks,
        Arc::clone(&config),
    ));
    let app = build_router(AppState::new(orchestrator));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        address = %addr,
        provider = %config.provider_url,
        environment = ?config.environment,
        "gateway listening"
    );
    tracing::info!(
        burst = config.rate.max_tokens,
        refill_per_sec = config.rate.refill_per_sec,
        "rate limit configured"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
