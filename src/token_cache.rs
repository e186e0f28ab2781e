// Access token cache with single-flight refresh
//
// Wraps any Authenticator. Tokens are keyed by credential identity and dropped
// `refresh_margin` before the server-side expiry. Concurrent misses for the same
// key queue on one refresh lock so only a single exchange goes out.

use crate::auth::Authenticator;
use crate::error::ApiError;
use crate::models::AccessToken;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct TokenCacheStats {
    pub hit_count: AtomicUsize,
    pub miss_count: AtomicUsize,
    pub refresh_count: AtomicUsize,
    pub failure_count: AtomicUsize,
    pub expired_count: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TokenCacheStatsReport {
    pub hit_count: usize,
    pub miss_count: usize,
    pub refresh_count: usize,
    pub failure_count: usize,
    pub expired_count: usize,
}

struct CachedToken {
    token: AccessToken,
    acquired_at: Instant,
    ttl: Duration,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }
}

pub struct CachedAuthenticator<A> {
    inner: A,
    tokens: DashMap<String, CachedToken>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    refresh_margin: Duration,
    stats: TokenCacheStats,
}

impl<A: Authenticator> CachedAuthenticator<A> {
    pub fn new(inner: A, refresh_margin: Duration) -> Self {
        Self {
            inner,
            tokens: DashMap::new(),
            refresh_locks: DashMap::new(),
            refresh_margin,
            stats: TokenCacheStats::default(),
        }
    }

    pub fn stats(&self) -> TokenCacheStatsReport {
        TokenCacheStatsReport {
            hit_count: self.stats.hit_count.load(Ordering::SeqCst),
            miss_count: self.stats.miss_count.load(Ordering::SeqCst),
            refresh_count: self.stats.refresh_count.load(Ordering::SeqCst),
            failure_count: self.stats.failure_count.load(Ordering::SeqCst),
            expired_count: self.stats.expired_count.load(Ordering::SeqCst),
        }
    }

    // Drop the cached token for this authenticator's identity
    pub fn invalidate(&self) -> bool {
        self.tokens.remove(self.inner.cache_key()).is_some()
    }

    fn lookup(&self, key: &str) -> Option<AccessToken> {
        let expired = match self.tokens.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.token.clone()),
            Some(_) => true,
            None => false,
        };

        // Ref is released above; removing while holding it would deadlock the shard
        if expired && self.tokens.remove(key).is_some() {
            self.stats.expired_count.fetch_add(1, Ordering::SeqCst);
        }
        None
    }

    fn refresh_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl<A: Authenticator> Authenticator for CachedAuthenticator<A> {
    async fn acquire_token(&self) -> Result<AccessToken, ApiError> {
        let key = self.inner.cache_key();

        if let Some(token) = self.lookup(key) {
            self.stats.hit_count.fetch_add(1, Ordering::SeqCst);
            return Ok(token);
        }

        let lock = self.refresh_lock(key);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(token) = self.lookup(key) {
            self.stats.hit_count.fetch_add(1, Ordering::SeqCst);
            return Ok(token);
        }

        self.stats.miss_count.fetch_add(1, Ordering::SeqCst);

        let token = match self.inner.acquire_token().await {
            Ok(token) => token,
            Err(e) => {
                self.stats.failure_count.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.stats.refresh_count.fetch_add(1, Ordering::SeqCst);

        let ttl = Duration::from_secs(token.expires_in).saturating_sub(self.refresh_margin);
        if ttl.is_zero() {
            tracing::debug!(
                expires_in = token.expires_in,
                "token lifetime shorter than refresh margin, not caching"
            );
        } else {
            self.tokens.insert(
                key.to_string(),
                CachedToken {
                    token: token.clone(),
                    acquired_at: Instant::now(),
                    ttl,
                },
            );
        }

        Ok(token)
    }

    fn cache_key(&self) -> &str {
        self.inner.cache_key()
    }
}
