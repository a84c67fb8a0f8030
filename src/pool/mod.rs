//! Upstream account pool.
//!
//! Accounts are read from a [`TokenStore`] through a short-lived
//! [`TtlCache`]; every write goes to the store and drops the cache. Selection
//! is random among accounts whose cool-down for the requested model family has
//! elapsed. Two concurrent requests may pick the same account; the loser hits a
//! 429 and marks it, which is cheaper than coordinating selection.

pub mod cache;
pub mod credential;
pub mod issuer;
pub mod store;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

pub use cache::{Clock, ManualClock, SystemClock, TtlCache};
pub use credential::Credential;
pub use issuer::{CredentialIssuer, GoogleOAuthIssuer, RefreshedToken};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};

use crate::config::PoolSettings;
use crate::error::Result;
use crate::logging::mask_identity;
use crate::models::ModelFamily;

/// Slack added on top of a cool-down before retrying after an auto-wait.
const WAIT_SLACK: Duration = Duration::from_millis(100);

/// Outcome of [`CredentialPool::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum Acquired {
    Credential(Credential),
    /// Every candidate is cooling down; the soonest frees up after this long.
    Wait(Duration),
    /// Nothing left to offer (empty pool, or all candidates excluded).
    None,
}

pub struct CredentialPool {
    store: Arc<dyn TokenStore>,
    issuer: Arc<dyn CredentialIssuer>,
    cache: TtlCache<Vec<Credential>>,
    clock: Arc<dyn Clock>,
    settings: PoolSettings,
}

impl CredentialPool {
    pub fn new(
        store: Arc<dyn TokenStore>,
        issuer: Arc<dyn CredentialIssuer>,
        settings: PoolSettings,
    ) -> Self {
        Self::with_clock(store, issuer, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn TokenStore>,
        issuer: Arc<dyn CredentialIssuer>,
        settings: PoolSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            issuer,
            cache: TtlCache::new(settings.cache_ttl, clock.clone()),
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// All accounts, served from the cache while it is fresh.
    pub async fn credentials(&self) -> Result<Vec<Credential>> {
        if let Some(cached) = self.cache.get() {
            return Ok(cached);
        }
        let credentials = self.store.list().await?;
        self.cache.put(credentials.clone());
        Ok(credentials)
    }

    pub async fn size(&self) -> Result<usize> {
        Ok(self.credentials().await?.len())
    }

    /// Pick an account for `family`, skipping `excluded` identities.
    ///
    /// The chosen account's access token is refreshed first when it is inside
    /// the expiry buffer. An account whose refresh fails is skipped for the
    /// rest of this call; after `max_retry_depth` such failures the pool gives
    /// up and returns [`Acquired::None`].
    pub async fn acquire(
        &self,
        family: ModelFamily,
        excluded: &HashSet<String>,
    ) -> Result<Acquired> {
        let mut skipped: HashSet<String> = HashSet::new();
        let mut failures = 0;

        loop {
            let now = self.clock.now_ms();
            let candidates: Vec<Credential> = self
                .credentials()
                .await?
                .into_iter()
                .filter(|c| !excluded.contains(&c.identity) && !skipped.contains(&c.identity))
                .collect();
            if candidates.is_empty() {
                return Ok(Acquired::None);
            }

            let (available, cooling): (Vec<Credential>, Vec<Credential>) = candidates
                .into_iter()
                .partition(|c| !c.is_limited_for(family, now));

            let chosen = available.choose(&mut rand::thread_rng()).cloned();
            let Some(chosen) = chosen else {
                let soonest = cooling
                    .iter()
                    .filter_map(|c| c.limited_until(family, now))
                    .min()
                    .unwrap_or(now);
                let wait = Duration::from_millis(u64::try_from(soonest - now).unwrap_or(0));
                debug!(family = %family.as_str(), wait_ms = wait.as_millis() as u64, "All candidates cooling");
                return Ok(Acquired::Wait(wait));
            };

            if !chosen.needs_refresh(now, self.settings.expiry_buffer) {
                return Ok(Acquired::Credential(chosen));
            }

            match self.refresh(chosen).await {
                Ok(refreshed) => return Ok(Acquired::Credential(refreshed)),
                Err((identity, e)) => {
                    warn!(account = %mask_identity(&identity), error = %e, "Token refresh failed, skipping account");
                    skipped.insert(identity);
                    failures += 1;
                    if failures >= self.settings.max_retry_depth {
                        return Ok(Acquired::None);
                    }
                }
            }
        }
    }

    /// [`acquire`](Self::acquire), sleeping once through a short cool-down.
    ///
    /// A wait longer than `max_auto_wait` is not taken; the caller gets `None`.
    pub async fn acquire_or_wait(
        &self,
        family: ModelFamily,
        excluded: &HashSet<String>,
    ) -> Result<Option<Credential>> {
        match self.acquire(family, excluded).await? {
            Acquired::Credential(c) => Ok(Some(c)),
            Acquired::None => Ok(None),
            Acquired::Wait(wait) if wait <= self.settings.max_auto_wait => {
                info!(wait_ms = wait.as_millis() as u64, "Waiting for an account to cool down");
                tokio::time::sleep(wait + WAIT_SLACK).await;
                match self.acquire(family, excluded).await? {
                    Acquired::Credential(c) => Ok(Some(c)),
                    _ => Ok(None),
                }
            }
            Acquired::Wait(_) => Ok(None),
        }
    }

    /// Start a cool-down on `identity` for `family`.
    pub async fn mark_limited(
        &self,
        identity: &str,
        family: ModelFamily,
        retry_after: Duration,
    ) -> Result<()> {
        let Some(mut credential) = self.store.get(identity).await? else {
            debug!(account = %mask_identity(identity), "Marking unknown account, ignored");
            return Ok(());
        };
        credential.mark_limited(family, self.clock.now_ms(), retry_after);
        self.store.put(&credential).await?;
        self.cache.invalidate();
        info!(
            account = %mask_identity(identity),
            family = %family.as_str(),
            retry_after_ms = retry_after.as_millis() as u64,
            "Account rate limited"
        );
        Ok(())
    }

    pub async fn add(&self, credential: Credential) -> Result<()> {
        self.store.put(&credential).await?;
        self.cache.invalidate();
        Ok(())
    }

    pub async fn remove(&self, identity: &str) -> Result<()> {
        self.store.delete(identity).await?;
        self.cache.invalidate();
        Ok(())
    }

    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    async fn refresh(
        &self,
        mut credential: Credential,
    ) -> std::result::Result<Credential, (String, crate::error::ProxyError)> {
        let token = match self.issuer.refresh(&credential.refresh_token).await {
            Ok(t) => t,
            Err(e) => return Err((credential.identity, e)),
        };
        credential.access_token = token.access_token;
        credential.expires_at = token.expires_at;
        if let Some(rotated) = token.refresh_token {
            credential.refresh_token = rotated;
        }

        let stored = self.store.put(&credential).await;
        self.cache.invalidate();
        match stored {
            Ok(()) => {
                debug!(account = %mask_identity(&credential.identity), "Access token refreshed");
                Ok(credential)
            }
            Err(e) => Err((credential.identity, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR_MS: i64 = 3_600_000;

    #[derive(Default)]
    struct FakeIssuer {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialIssuer for FakeIssuer {
        async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProxyError::refresh("invalid_grant"));
            }
            Ok(RefreshedToken {
                access_token: format!("fresh-{refresh_token}"),
                expires_at: 10 * HOUR_MS,
                refresh_token: None,
            })
        }
    }

    fn cred(identity: &str) -> Credential {
        Credential::new(identity, "at", format!("rt-{identity}"), "proj", 5 * HOUR_MS)
    }

    fn pool_with(
        credentials: Vec<Credential>,
        issuer: Arc<FakeIssuer>,
    ) -> (CredentialPool, Arc<MemoryTokenStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryTokenStore::with_credentials(credentials));
        let clock = Arc::new(ManualClock::new(HOUR_MS));
        let pool = CredentialPool::with_clock(
            store.clone(),
            issuer,
            PoolSettings::default(),
            clock.clone(),
        );
        (pool, store, clock)
    }

    #[tokio::test]
    async fn test_empty_pool_yields_none() {
        let (pool, _, _) = pool_with(vec![], Arc::default());
        assert_eq!(
            pool.acquire(ModelFamily::Claude, &HashSet::new()).await.unwrap(),
            Acquired::None
        );
        assert_eq!(pool.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_acquire_skips_cooling_accounts() {
        let mut limited = cred("a");
        limited.mark_limited(ModelFamily::Claude, HOUR_MS, Duration::from_secs(60));
        let (pool, _, _) = pool_with(vec![limited, cred("b"), cred("c")], Arc::default());

        for _ in 0..20 {
            match pool.acquire(ModelFamily::Claude, &HashSet::new()).await.unwrap() {
                Acquired::Credential(c) => assert_ne!(c.identity, "a"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_all_cooling_returns_soonest_wait() {
        let mut a = cred("a");
        a.mark_limited(ModelFamily::Claude, HOUR_MS, Duration::from_millis(9_000));
        let mut b = cred("b");
        b.mark_limited(ModelFamily::Claude, HOUR_MS, Duration::from_millis(4_000));
        let (pool, _, clock) = pool_with(vec![a, b], Arc::default());

        clock.advance(Duration::from_millis(1_000));
        assert_eq!(
            pool.acquire(ModelFamily::Claude, &HashSet::new()).await.unwrap(),
            Acquired::Wait(Duration::from_millis(3_000))
        );
    }

    #[tokio::test]
    async fn test_mark_limited_is_per_family() {
        let (pool, store, _) = pool_with(vec![cred("a")], Arc::default());

        pool.mark_limited("a", ModelFamily::Gemini, Duration::from_millis(5_000))
            .await
            .unwrap();

        assert!(matches!(
            pool.acquire(ModelFamily::Claude, &HashSet::new()).await.unwrap(),
            Acquired::Credential(_)
        ));
        assert_eq!(
            pool.acquire(ModelFamily::Gemini, &HashSet::new()).await.unwrap(),
            Acquired::Wait(Duration::from_millis(5_000))
        );
        let stored = store.get("a").await.unwrap().unwrap();
        assert!(stored.rate_limits.contains_key(&ModelFamily::Gemini));
    }

    #[tokio::test]
    async fn test_excluded_accounts_are_never_returned() {
        let (pool, _, _) = pool_with(vec![cred("a"), cred("b")], Arc::default());
        let excluded: HashSet<String> = ["a".to_string()].into();

        match pool.acquire(ModelFamily::Gemini, &excluded).await.unwrap() {
            Acquired::Credential(c) => assert_eq!(c.identity, "b"),
            other => panic!("unexpected {other:?}"),
        }

        let all: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        assert_eq!(
            pool.acquire(ModelFamily::Gemini, &all).await.unwrap(),
            Acquired::None
        );
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let mut expiring = cred("a");
        expiring.expires_at = HOUR_MS + 60_000;
        let issuer = Arc::new(FakeIssuer::default());
        let (pool, store, _) = pool_with(vec![expiring], issuer.clone());

        let Acquired::Credential(c) = pool.acquire(ModelFamily::Claude, &HashSet::new()).await.unwrap() else {
            panic!("expected a credential");
        };
        assert_eq!(c.access_token, "fresh-rt-a");
        assert_eq!(c.refresh_token, "rt-a");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("a").await.unwrap().unwrap().expires_at, 10 * HOUR_MS);
    }

    #[tokio::test]
    async fn test_refresh_failures_are_bounded() {
        let accounts = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|id| {
                let mut c = cred(id);
                c.expires_at = 0;
                c
            })
            .collect();
        let issuer = Arc::new(FakeIssuer {
            fail: true,
            ..Default::default()
        });
        let (pool, _, _) = pool_with(accounts, issuer.clone());

        assert_eq!(
            pool.acquire(ModelFamily::Claude, &HashSet::new()).await.unwrap(),
            Acquired::None
        );
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cache_serves_stale_reads_until_invalidated() {
        let (pool, store, clock) = pool_with(vec![cred("a")], Arc::default());
        assert_eq!(pool.size().await.unwrap(), 1);

        store.put(&cred("b")).await.unwrap();
        assert_eq!(pool.size().await.unwrap(), 1);

        clock.advance(Duration::from_secs(30));
        assert_eq!(pool.size().await.unwrap(), 2);

        pool.add(cred("c")).await.unwrap();
        assert_eq!(pool.size().await.unwrap(), 3);
        pool.remove("a").await.unwrap();
        assert_eq!(pool.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_acquire_or_wait_sleeps_through_short_cool_down() {
        let clock = Arc::new(SystemClock);
        let mut a = cred("a");
        a.expires_at = i64::MAX;
        a.mark_limited(ModelFamily::Claude, clock.now_ms(), Duration::from_millis(200));
        let pool = CredentialPool::with_clock(
            Arc::new(MemoryTokenStore::with_credentials(vec![a])),
            Arc::new(FakeIssuer::default()),
            PoolSettings::default(),
            clock,
        );

        let got = pool
            .acquire_or_wait(ModelFamily::Claude, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(got.map(|c| c.identity), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_long_cool_down_is_not_waited_for() {
        let mut a = cred("a");
        a.mark_limited(ModelFamily::Claude, HOUR_MS, Duration::from_secs(60));
        let (pool, _, _) = pool_with(vec![a], Arc::default());

        let started = std::time::Instant::now();
        let got = pool
            .acquire_or_wait(ModelFamily::Claude, &HashSet::new())
            .await
            .unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
