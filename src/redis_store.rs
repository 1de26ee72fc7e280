//! Redis-backed limiter and session lock, shared across gateway replicas.
//!
//! Both use the server clock (`TIME` inside the script, `EX` on the lock) so
//! replicas with skewed clocks still agree. Lock values are per-generation
//! tokens and release is a compare-and-delete script.

use async_trait::async_trait;
use fred::interfaces::{KeysInterface, LuaInterface};
use fred::prelude::*;
use fred::types::{Expiration, SetOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::rate_limit::{RateConfig, RateDecision, RateLimiter};
use crate::session_lock::{LockToken, SessionLock};

const RATE_PREFIX: &str = "ensemble:rate:";
const LOCK_PREFIX: &str = "ensemble:lock:";

// KEYS[1] = bucket hash
// ARGV[1] = capacity, ARGV[2] = refill per millisecond, ARGV[3] = key ttl seconds
// returns {admitted, remaining, retry_after_secs}
const TOKEN_BUCKET: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local bucket = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(bucket[1]) or capacity
local ts = tonumber(bucket[2]) or now
tokens = math.min(capacity, tokens + math.max(0, now - ts) * rate)
local admitted = 0
local retry = 0
if tokens >= 1 then
  tokens = tokens - 1
  admitted = 1
else
  retry = math.ceil((1 - tokens) / rate / 1000)
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', now)
redis.call('EXPIRE', KEYS[1], ARGV[3])
return {admitted, math.floor(tokens), retry}
"#;

// KEYS[1] = lock key, ARGV[1] = token
const RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn store_error(error: RedisError) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

pub async fn connect(url: &str) -> Result<RedisClient, StoreError> {
    let config = RedisConfig::from_url(url).map_err(store_error)?;
    let client = RedisClient::new(config, None, None, None);
    client.init().await.map_err(store_error)?;
    Ok(client)
}

#[derive(Clone)]
pub struct RedisRateLimiter {
    client: RedisClient,
    config: RateConfig,
    script_sha: Arc<RwLock<Option<String>>>,
}

impl RedisRateLimiter {
    pub fn new(client: RedisClient, config: RateConfig) -> Self {
        Self {
            client,
            config,
            script_sha: Arc::new(RwLock::new(None)),
        }
    }

    async fn load_script(&self) -> Result<String, StoreError> {
        let sha = self
            .client
            .script_load::<String, _>(TOKEN_BUCKET)
            .await
            .map_err(store_error)?;
        *self.script_sha.write().await = Some(sha.clone());
        Ok(sha)
    }

    async fn eval(&self, key: String, args: Vec<String>) -> Result<Vec<i64>, StoreError> {
        let cached = self.script_sha.read().await.clone();
        let sha = match cached {
            Some(sha) => sha,
            None => self.load_script().await?,
        };

        match self
            .client
            .evalsha::<Vec<i64>, _, _, _>(sha, vec![key.clone()], args.clone())
            .await
        {
            Ok(reply) => Ok(reply),
            Err(error) if error.to_string().to_ascii_uppercase().contains("NOSCRIPT") => {
                let sha = self.load_script().await?;
                self.client
                    .evalsha::<Vec<i64>, _, _, _>(sha, vec![key], args)
                    .await
                    .map_err(store_error)
            }
            Err(error) => Err(store_error(error)),
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, identity: &str) -> Result<RateDecision, StoreError> {
        let idle_ttl = (self.config.full_refill().as_secs() * 2).max(1);
        let args = vec![
            self.config.max_tokens.to_string(),
            (self.config.refill_per_sec / 1000.0).to_string(),
            idle_ttl.to_string(),
        ];
        let reply = self.eval(format!("{RATE_PREFIX}{identity}"), args).await?;
        let [admitted, remaining, retry_after] = reply[..] else {
            return Err(StoreError::Unavailable(format!(
                "unexpected limiter reply of {} values",
                reply.len()
            )));
        };

        let admitted = admitted == 1;
        Ok(RateDecision {
            admitted,
            remaining: remaining.max(0) as u32,
            retry_after_secs: (!admitted).then(|| retry_after.max(1) as u64),
        })
    }
}

#[derive(Clone)]
pub struct RedisSessionLock {
    client: RedisClient,
}

impl RedisSessionLock {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionLock for RedisSessionLock {
    async fn acquire(
        &self,
        session_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, StoreError> {
        let token = LockToken::generate();
        let reply = self
            .client
            .set::<Option<String>, _, _>(
                format!("{LOCK_PREFIX}{session_id}"),
                token.as_str(),
                Some(Expiration::EX(ttl.as_secs().max(1) as i64)),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(store_error)?;
        Ok(reply.map(|_| token))
    }

    async fn release(&self, session_id: &str, token: &LockToken) -> Result<(), StoreError> {
        let removed = self
            .client
            .eval::<i64, _, _, _>(
                RELEASE_LOCK,
                vec![format!("{LOCK_PREFIX}{session_id}")],
                vec![token.as_str().to_string()],
            )
            .await
            .map_err(store_error)?;
        if removed == 0 {
            tracing::debug!(session_id, "session lock already expired or taken over");
        }
        Ok(())
    }
}
