//! Expiry-aware access token cache
//!
//! Each entry carries an absolute expiry computed from the injected clock at
//! write time. Reads check expiry lazily and evict what they find expired,
//! so an expired token is never returned. `sweep()` exists only to bound
//! memory when many identities go idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::Secret;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::debug;

use crate::clock::Clock;

/// Short-lived bearer credential. Redacted in `Debug`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken(Secret<String>);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token.into()))
    }

    pub fn as_str(&self) -> &str {
        self.0.expose()
    }

    /// `Authorization` header value for downstream API calls.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0.expose())
    }
}

#[derive(Debug)]
struct CachedToken {
    token: AccessToken,
    expires_at: Instant,
}

pub struct AccessTokenCache {
    entries: RwLock<HashMap<String, CachedToken>>,
    clock: Arc<dyn Clock>,
}

impl AccessTokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Cache `token` until `now + ttl`, superseding any previous entry.
    ///
    /// `ttl` is the effective lifetime, not the provider's raw `expires_in`.
    #[cfg(test)]
    pub(crate) async fn put(&self, identity: &str, token: AccessToken, ttl: Duration) {
        self.lock().await.insert(identity, token, ttl);
    }

    /// Exclusive access for writes that must land together with a refresh
    /// token update.
    pub(crate) async fn lock(&self) -> CacheWriter<'_> {
        CacheWriter {
            entries: self.entries.write().await,
            clock: self.clock.as_ref(),
        }
    }

    /// Live token for `identity`, or `None` once its expiry has been reached.
    pub async fn get(&self, identity: &str) -> Option<AccessToken> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(identity) {
                Some(entry) if now < entry.expires_at => return Some(entry.token.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: evict unless a fresh write landed between the two locks
        let mut entries = self.entries.write().await;
        let expired = match entries.get(identity) {
            Some(entry) if now < entry.expires_at => return Some(entry.token.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(identity);
            debug!(identity, "evicted expired access token");
        }
        None
    }

    pub(crate) async fn remove(&self, identity: &str) {
        self.lock().await.remove(identity);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    /// Number of stored entries, expired ones included until read or swept.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write guard over the cache. Inserts through it never yield.
pub(crate) struct CacheWriter<'a> {
    entries: RwLockWriteGuard<'a, HashMap<String, CachedToken>>,
    clock: &'a dyn Clock,
}

impl CacheWriter<'_> {
    pub(crate) fn insert(&mut self, identity: &str, token: AccessToken, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .insert(identity.to_owned(), CachedToken { token, expires_at });
        debug!(identity, ttl_secs = ttl.as_secs(), "cached access token");
    }

    pub(crate) fn remove(&mut self, identity: &str) {
        self.entries.remove(identity);
    }
}
