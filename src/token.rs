//! Process-wide access token cache for the WeCom send API.
//!
//! One background task owns refreshing; any number of senders read the
//! current value without waiting for it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(test)]
use mockall::automock;

use crate::error::Result;
use crate::retry::RetryPolicy;

const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// A freshly issued token as reported by the token endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: Duration,
}

/// The cached token with its absolute expiry
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn fetch_token(&self) -> Result<TokenGrant>;
}

#[derive(Default)]
struct CacheState {
    token: Option<AccessToken>,
    refresher: Option<JoinHandle<()>>,
}

pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    safety_margin: Duration,
    retry: RetryPolicy,
    state: RwLock<CacheState>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>, safety_margin: Duration, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            source,
            safety_margin,
            retry,
            state: RwLock::new(CacheState::default()),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest successfully fetched token, `None` until the first refresh lands.
    pub fn get(&self) -> Option<AccessToken> {
        self.read_state().token.clone()
    }

    /// Token value for the `access_token` query parameter; empty while unset.
    pub fn access_token(&self) -> String {
        self.get().map(|t| t.value).unwrap_or_default()
    }

    /// Fetch a new token and store it. Returns the delay until the next
    /// refresh is due. On failure the cached value is left untouched.
    pub async fn refresh(&self) -> Result<Duration> {
        let grant = self.source.fetch_token().await?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(grant.expires_in).unwrap_or(chrono::Duration::zero());

        self.write_state().token = Some(AccessToken {
            value: grant.access_token,
            expires_at,
        });

        Ok(grant
            .expires_in
            .saturating_sub(self.safety_margin)
            .max(MIN_REFRESH_DELAY))
    }

    /// Start the refresh loop, replacing any loop started earlier.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut state = self.write_state();
        if let Some(previous) = state.refresher.take() {
            previous.abort();
        }
        state.refresher = Some(tokio::spawn(refresh_loop(weak)));
    }
}

impl Drop for TokenCache {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(refresher) = state.refresher.take() {
            refresher.abort();
        }
    }
}

async fn refresh_loop(cache: Weak<TokenCache>) {
    let mut failures: u32 = 0;
    loop {
        let Some(strong) = cache.upgrade() else {
            return;
        };
        let delay = match strong.refresh().await {
            Ok(next) => {
                failures = 0;
                tracing::info!(
                    next_refresh_secs = next.as_secs(),
                    "Access token refreshed"
                );
                next
            }
            Err(e) => {
                let backoff = strong.retry.delay_for(failures);
                failures = failures.saturating_add(1);
                tracing::warn!(
                    attempt = failures,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Failed to refresh access token: {}",
                    e
                );
                backoff
            }
        };
        drop(strong);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::retry::RetryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn grant(token: &str, secs: u64) -> TokenGrant {
        TokenGrant {
            access_token: token.to_string(),
            expires_in: Duration::from_secs(secs),
        }
    }

    fn fixed_retry() -> RetryPolicy {
        RetryPolicy::ExponentialBackoff(RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            backoff_base: 2.0,
            jitter_factor: 0.0,
        })
    }

    #[tokio::test]
    async fn test_unset_cache_reads_empty_then_fetched_value() {
        let mut source = MockTokenSource::new();
        source
            .expect_fetch_token()
            .times(1)
            .returning(|| Ok(grant("tok-1", 7200)));
        let cache = TokenCache::new(Arc::new(source), Duration::from_secs(10), fixed_retry());

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.access_token() })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), "");
        }
        assert!(cache.get().is_none());

        let next = cache.refresh().await.unwrap();
        assert_eq!(next, Duration::from_secs(7190));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.access_token() })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), "tok-1");
        }
        assert!(cache.get().unwrap().expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_value() {
        let mut source = MockTokenSource::new();
        let mut calls = 0;
        source.expect_fetch_token().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(grant("tok-1", 7200))
            } else {
                Err(RelayError::WeCom {
                    code: 42001,
                    message: "access_token expired".into(),
                })
            }
        });
        let cache = TokenCache::new(Arc::new(source), Duration::from_secs(10), fixed_retry());

        cache.refresh().await.unwrap();
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.access_token(), "tok-1");
    }

    #[tokio::test]
    async fn test_short_expiry_floors_refresh_delay() {
        let mut source = MockTokenSource::new();
        source
            .expect_fetch_token()
            .returning(|| Ok(grant("tok", 5)));
        let cache = TokenCache::new(Arc::new(source), Duration::from_secs(10), fixed_retry());
        assert_eq!(cache.refresh().await.unwrap(), MIN_REFRESH_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_retries_after_failure() {
        let mut source = MockTokenSource::new();
        let mut calls = 0;
        source.expect_fetch_token().returning(move || {
            calls += 1;
            if calls < 3 {
                Err(RelayError::Internal("token endpoint unavailable".into()))
            } else {
                Ok(grant(&format!("tok-{calls}"), 7200))
            }
        });
        let cache = TokenCache::new(Arc::new(source), Duration::from_secs(10), fixed_retry());
        cache.start();

        for _ in 0..100 {
            if cache.get().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(cache.access_token(), "tok-3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut source = MockTokenSource::new();
        let counter = calls.clone();
        source.expect_fetch_token().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(grant("tok", 7200))
        });
        let cache = TokenCache::new(Arc::new(source), Duration::from_secs(10), fixed_retry());

        cache.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.access_token(), "tok");

        // The second loop fetches at once; the first one must not fire at 7190s.
        cache.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
