use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use std::time::Duration;

use crate::rate_limit::RateConfig;
use crate::stream_client::StreamPolicy;
use crate::synthesis::SynthesisBudget;

// CLI argument structure, every flag can also come from the environment
#[derive(Parser, Clone)]
#[command(name = "ensemble-gateway")]
#[command(about = "Fans a prompt out to several models and streams a synthesized answer")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // OpenAI-compatible provider base url
    #[arg(long, env = "PROVIDER_URL", default_value = "https://openrouter.ai/api/v1")]
    pub provider_url: String,

    // Server-side provider key, used when a request carries no bearer token
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    // Burst size of the per-credential token bucket
    #[arg(long, env = "RATE_LIMIT", default_value_t = 10)]
    pub rate_limit: u32,

    // Seconds to refill a full bucket
    #[arg(long, env = "RATE_WINDOW", default_value_t = 60)]
    pub rate_window: u64,

    // Seconds between stale bucket sweeps
    #[arg(long, default_value_t = 60)]
    pub sweep_interval: u64,

    // Session lock TTL in seconds
    #[arg(long, env = "SESSION_TTL", default_value_t = 300)]
    pub session_ttl: u64,

    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_body_bytes: usize,

    #[arg(long, default_value_t = 50_000)]
    pub max_prompt_chars: usize,

    #[arg(long, default_value_t = 8)]
    pub max_models: usize,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, default_value_t = 1000)]
    pub backoff_base_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub backoff_max_ms: u64,

    // Seconds to wait for the first chunk of an attempt
    #[arg(long, default_value_t = 120)]
    pub initial_timeout: u64,

    // Seconds of silence tolerated once a stream has started
    #[arg(long, default_value_t = 30)]
    pub activity_timeout: u64,

    // Default synthesis model (falls back to the first requested model)
    #[arg(long, env = "REFINEMENT_MODEL_NAME")]
    pub refinement_model: Option<String>,

    #[arg(long, default_value_t = 128_000)]
    pub context_limit: usize,

    #[arg(long, default_value_t = 4096)]
    pub response_reserve: usize,

    #[arg(long, default_value_t = 12_000)]
    pub max_synthesis_chars: usize,

    #[arg(long, default_value_t = 0.8)]
    pub context_warning_threshold: f64,

    #[arg(long, env = "ENVIRONMENT", value_enum, default_value_t = Environment::Production)]
    pub environment: Environment,

    // Emit debug_prompt events with the assembled synthesis prompt
    #[arg(long, default_value_t = false)]
    pub debug_prompts: bool,

    #[arg(long, default_value_t = false)]
    pub log_json: bool,

    #[cfg(feature = "redis")]
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    Production,
    Development,
}

/// Request-shape ceilings enforced before any work starts.
#[derive(Debug, Clone)]
pub struct RequestLimits {
    pub max_body_bytes: usize,
    pub max_prompt_chars: usize,
    pub max_models: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            max_prompt_chars: 50_000,
            max_models: 8,
        }
    }
}

/// Validated runtime configuration shared by every request.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub provider_url: String,
    pub api_key: Option<SecretString>,
    pub limits: RequestLimits,
    pub rate: RateConfig,
    pub sweep_interval: Duration,
    pub session_ttl: Duration,
    pub stream: StreamPolicy,
    pub refinement_model: Option<String>,
    pub synthesis: SynthesisBudget,
    pub environment: Environment,
    pub debug_prompts: bool,
    pub log_json: bool,
    pub redis_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            provider_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            limits: RequestLimits::default(),
            rate: RateConfig::per_window(10, Duration::from_secs(60)),
            sweep_interval: Duration::from_secs(60),
            session_ttl: Duration::from_secs(300),
            stream: StreamPolicy::default(),
            refinement_model: None,
            synthesis: SynthesisBudget::default(),
            environment: Environment::Production,
            debug_prompts: false,
            log_json: false,
            redis_url: None,
        }
    }
}

impl TryFrom<Args> for GatewayConfig {
    type Error = String;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.rate_limit == 0 || args.rate_window == 0 {
            return Err("rate limit and rate window must be positive".to_string());
        }
        if !(args.context_warning_threshold > 0.0 && args.context_warning_threshold <= 1.0) {
            return Err("context warning threshold must be within (0, 1]".to_string());
        }
        if args.response_reserve >= args.context_limit {
            return Err("response reserve must be smaller than the context limit".to_string());
        }
        if args.backoff_base_ms == 0 || args.backoff_max_ms < args.backoff_base_ms {
            return Err("backoff max must be at least the (positive) backoff base".to_string());
        }
        if args.max_models == 0 {
            return Err("max models must be positive".to_string());
        }

        let debug_prompts = args.debug_prompts && args.environment == Environment::Development;

        #[cfg(feature = "redis")]
        let redis_url = args.redis_url;
        #[cfg(not(feature = "redis"))]
        let redis_url = None;

        Ok(Self {
            port: args.port,
            provider_url: args.provider_url.trim_end_matches('/').to_string(),
            api_key: args
                .api_key
                .filter(|key| !key.trim().is_empty())
                .map(SecretString::new),
            limits: RequestLimits {
                max_body_bytes: args.max_body_bytes,
                max_prompt_chars: args.max_prompt_chars,
                max_models: args.max_models,
            },
            rate: RateConfig::per_window(args.rate_limit, Duration::from_secs(args.rate_window)),
            sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
            session_ttl: Duration::from_secs(args.session_ttl.max(1)),
            stream: StreamPolicy {
                max_retries: args.max_retries,
                base_delay: Duration::from_millis(args.backoff_base_ms),
                max_delay: Duration::from_millis(args.backoff_max_ms),
                jitter: true,
                initial_timeout: Duration::from_secs(args.initial_timeout.max(1)),
                activity_timeout: Duration::from_secs(args.activity_timeout.max(1)),
            },
            refinement_model: args.refinement_model.filter(|m| !m.trim().is_empty()),
            synthesis: SynthesisBudget {
                max_chars_per_model: args.max_synthesis_chars,
                context_limit: args.context_limit,
                response_reserve: args.response_reserve,
                warn_threshold: args.context_warning_threshold,
            },
            environment: args.environment,
            debug_prompts,
            log_json: args.log_json,
            redis_url,
        })
    }
}
