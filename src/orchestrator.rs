//! Account rotation around one upstream call.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ProxyError, Result};
use crate::logging::{LogLevel, SharedLogger};
use crate::models::ModelFamily;
use crate::pool::{Credential, CredentialPool};

/// What the orchestrator needs from the account pool.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn size(&self) -> Result<usize>;

    /// An account for `family` outside `excluded`, possibly after a short wait.
    async fn acquire(
        &self,
        family: ModelFamily,
        excluded: &HashSet<String>,
    ) -> Result<Option<Credential>>;

    async fn mark_limited(
        &self,
        identity: &str,
        family: ModelFamily,
        retry_after: Duration,
    ) -> Result<()>;
}

#[async_trait]
impl CredentialSource for CredentialPool {
    async fn size(&self) -> Result<usize> {
        CredentialPool::size(self).await
    }

    async fn acquire(
        &self,
        family: ModelFamily,
        excluded: &HashSet<String>,
    ) -> Result<Option<Credential>> {
        self.acquire_or_wait(family, excluded).await
    }

    async fn mark_limited(
        &self,
        identity: &str,
        family: ModelFamily,
        retry_after: Duration,
    ) -> Result<()> {
        CredentialPool::mark_limited(self, identity, family, retry_after).await
    }
}

/// Runs a call against successive accounts until one is not rate limited.
#[derive(Clone)]
pub struct Orchestrator {
    source: Arc<dyn CredentialSource>,
    logger: SharedLogger,
    default_delay: Duration,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn CredentialSource>,
        logger: SharedLogger,
        default_delay: Duration,
    ) -> Self {
        Self {
            source,
            logger,
            default_delay,
        }
    }

    pub async fn pool_size(&self) -> Result<usize> {
        self.source.size().await
    }

    /// Invoke `call` with an account, rotating on upstream 429s.
    ///
    /// Each account is tried at most once. A rate-limited account is marked for
    /// the delay the upstream suggested (or the default) before moving on. Any
    /// other error is returned as is.
    pub async fn execute<T, F, Fut>(
        &self,
        family: ModelFamily,
        request_id: &str,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(Credential) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let size = self.source.size().await?;
        if size == 0 {
            return Err(ProxyError::NoCredential);
        }

        let mut tried: HashSet<String> = HashSet::new();
        for attempt in 1..=size {
            let Some(credential) = self.source.acquire(family, &tried).await? else {
                if tried.is_empty() {
                    return Err(ProxyError::CredentialExhausted);
                }
                break;
            };
            let identity = credential.identity.clone();
            tried.insert(identity.clone());

            tracing::debug!(attempt, family = %family.as_str(), "Dispatching upstream call");
            match call(credential).await {
                Ok(value) => return Ok(value),
                Err(ProxyError::RateLimited { retry_after, .. }) => {
                    let delay = retry_after.unwrap_or(self.default_delay);
                    self.source.mark_limited(&identity, family, delay).await?;
                    self.logger.account_event(
                        LogLevel::Warn,
                        request_id,
                        &identity,
                        format!(
                            "rate limited on {} for {} ms, rotating",
                            family.as_str(),
                            delay.as_millis()
                        ),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.logger.error(
            "rotation",
            format!("[{}] all {} tried accounts rate limited", request_id, tried.len()),
        );
        Err(ProxyError::AllRateLimited { tried: tried.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Hands out accounts in order, skipping excluded ones.
    #[derive(Default)]
    struct ScriptedSource {
        credentials: Vec<Credential>,
        marked: Mutex<Vec<(String, ModelFamily, Duration)>>,
    }

    impl ScriptedSource {
        fn with(ids: &[&str]) -> Self {
            Self {
                credentials: ids
                    .iter()
                    .map(|id| Credential::new(*id, format!("token-{id}"), "rt", "proj", i64::MAX))
                    .collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CredentialSource for ScriptedSource {
        async fn size(&self) -> Result<usize> {
            Ok(self.credentials.len())
        }

        async fn acquire(
            &self,
            _family: ModelFamily,
            excluded: &HashSet<String>,
        ) -> Result<Option<Credential>> {
            Ok(self
                .credentials
                .iter()
                .find(|c| !excluded.contains(&c.identity))
                .cloned())
        }

        async fn mark_limited(
            &self,
            identity: &str,
            family: ModelFamily,
            retry_after: Duration,
        ) -> Result<()> {
            self.marked
                .lock()
                .unwrap()
                .push((identity.to_string(), family, retry_after));
            Ok(())
        }
    }

    fn limited(ms: Option<u64>) -> ProxyError {
        ProxyError::RateLimited {
            retry_after: ms.map(Duration::from_millis),
            body: String::new(),
        }
    }

    fn orchestrator(source: Arc<ScriptedSource>) -> Orchestrator {
        Orchestrator::new(source, SharedLogger::in_memory(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_rotates_past_rate_limited_account() {
        let source = Arc::new(ScriptedSource::with(&["a", "b"]));
        let orch = orchestrator(source.clone());

        let result = orch
            .execute(ModelFamily::Claude, "req-1", |cred| async move {
                if cred.identity == "a" {
                    Err(limited(Some(1000)))
                } else {
                    Ok(cred.access_token)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "token-b");
        let marked = source.marked.lock().unwrap().clone();
        assert_eq!(
            marked,
            vec![("a".to_string(), ModelFamily::Claude, Duration::from_millis(1000))]
        );
    }

    #[tokio::test]
    async fn test_default_delay_when_upstream_gives_none() {
        let source = Arc::new(ScriptedSource::with(&["a", "b"]));
        let orch = orchestrator(source.clone());

        let err = orch
            .execute(ModelFamily::Gemini, "req-2", |_| async {
                Err::<(), _>(limited(None))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::AllRateLimited { tried: 2 }));
        let marked = source.marked.lock().unwrap().clone();
        assert_eq!(marked.len(), 2);
        assert!(marked.iter().all(|(_, _, d)| *d == Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let source = Arc::new(ScriptedSource::with(&["a", "b"]));
        let orch = orchestrator(source.clone());
        let mut calls = 0;

        let err = orch
            .execute(ModelFamily::Claude, "req-3", |_| {
                calls += 1;
                async {
                    Err::<(), _>(ProxyError::Upstream {
                        status: 400,
                        body: "bad".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Upstream { status: 400, .. }));
        assert_eq!(calls, 1);
        assert!(source.marked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_pool_is_no_credential() {
        let orch = orchestrator(Arc::new(ScriptedSource::default()));
        let err = orch
            .execute(ModelFamily::Claude, "req-4", |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoCredential));
    }

    #[tokio::test]
    async fn test_nothing_available_is_exhausted() {
        struct Unavailable;

        #[async_trait]
        impl CredentialSource for Unavailable {
            async fn size(&self) -> Result<usize> {
                Ok(2)
            }
            async fn acquire(
                &self,
                _: ModelFamily,
                _: &HashSet<String>,
            ) -> Result<Option<Credential>> {
                Ok(None)
            }
            async fn mark_limited(&self, _: &str, _: ModelFamily, _: Duration) -> Result<()> {
                Ok(())
            }
        }

        let orch = Orchestrator::new(
            Arc::new(Unavailable),
            SharedLogger::in_memory(),
            Duration::from_secs(60),
        );
        let err = orch
            .execute(ModelFamily::Claude, "req-5", |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::CredentialExhausted));
    }
}
