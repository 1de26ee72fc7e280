use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::metrics::STORE_FAILURES;

/// Proof of holding a session lock. Release only removes a lock that still
/// carries the token it was acquired with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Mutex keyed by session id. An entry means a generation is running.
#[async_trait]
pub trait SessionLock: Send + Sync {
    /// Set-if-absent with expiry. `None` means another generation holds it.
    async fn acquire(
        &self,
        session_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, StoreError>;

    /// Compare-and-delete: a lock that expired and was taken over by
    /// another generation is left alone.
    async fn release(&self, session_id: &str, token: &LockToken) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Held(LockToken),
    Busy,
    /// The store could not be reached and the generation runs unlocked.
    Bypassed,
}

/// Acquires the lock, allowing the request when the lock store is down.
pub async fn acquire_or_allow(
    locks: &dyn SessionLock,
    session_id: &str,
    ttl: Duration,
) -> LockOutcome {
    match locks.acquire(session_id, ttl).await {
        Ok(Some(token)) => LockOutcome::Held(token),
        Ok(None) => LockOutcome::Busy,
        Err(err) => {
            STORE_FAILURES.with_label_values(&["session_lock"]).inc();
            tracing::warn!(error = %err, "session lock unavailable, allowing generation");
            LockOutcome::Bypassed
        }
    }
}

pub async fn release_quietly(locks: &dyn SessionLock, session_id: &str, token: &LockToken) {
    if let Err(err) = locks.release(session_id, token).await {
        STORE_FAILURES.with_label_values(&["session_lock"]).inc();
        tracing::warn!(error = %err, "failed to release session lock, it will expire");
    }
}

struct Held {
    token: LockToken,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemorySessionLock {
    entries: DashMap<String, Held>,
}

impl InMemorySessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_at(&self, session_id: &str, ttl: Duration, now: Instant) -> Option<LockToken> {
        let token = LockToken::generate();
        let held = Held {
            token: token.clone(),
            expires_at: now + ttl,
        };
        match self.entries.entry(session_id.to_string()) {
            Entry::Occupied(mut current) => {
                if current.get().expires_at > now {
                    return None;
                }
                // expired, take it over
                current.insert(held);
            }
            Entry::Vacant(slot) => {
                slot.insert(held);
            }
        }
        Some(token)
    }

    pub fn is_held(&self, session_id: &str) -> bool {
        self.entries
            .get(session_id)
            .is_some_and(|held| held.expires_at > Instant::now())
    }
}

#[async_trait]
impl SessionLock for InMemorySessionLock {
    async fn acquire(
        &self,
        session_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, StoreError> {
        Ok(self.acquire_at(session_id, ttl, Instant::now()))
    }

    async fn release(&self, session_id: &str, token: &LockToken) -> Result<(), StoreError> {
        self.entries.remove_if(session_id, |_, held| held.token == *token);
        Ok(())
    }
}
