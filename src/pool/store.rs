//! Credential persistence.
//!
//! - [`FileTokenStore`] keeps accounts in one JSON file (0600 on Unix)
//! - [`MemoryTokenStore`] keeps them in memory (tests, ephemeral runs)

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument};

use super::credential::Credential;
use crate::error::{ProxyError, Result};

/// Storage backend for upstream accounts, keyed by identity.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Credential>>;

    async fn get(&self, identity: &str) -> Result<Option<Credential>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|c| c.identity == identity))
    }

    /// Insert or replace by identity.
    async fn put(&self, credential: &Credential) -> Result<()>;

    async fn delete(&self, identity: &str) -> Result<()>;
}

fn upsert(all: &mut Vec<Credential>, credential: &Credential) {
    match all.iter_mut().find(|c| c.identity == credential.identity) {
        Some(existing) => *existing = credential.clone(),
        None => all.push(credential.clone()),
    }
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    credentials: RwLock<Vec<Credential>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Vec<Credential>) -> Self {
        Self {
            credentials: RwLock::new(credentials),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn list(&self) -> Result<Vec<Credential>> {
        Ok(self.credentials.read().await.clone())
    }

    async fn put(&self, credential: &Credential) -> Result<()> {
        upsert(&mut *self.credentials.write().await, credential);
        Ok(())
    }

    async fn delete(&self, identity: &str) -> Result<()> {
        self.credentials
            .write()
            .await
            .retain(|c| c.identity != identity);
        Ok(())
    }
}

/// Accounts as a JSON array in one file.
///
/// Writes go to a sibling temp file that is then renamed over the target, so
/// a crash never leaves a half-written file. Read-modify-write cycles are
/// serialized through `write_lock`.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<Credential>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ProxyError::store(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            ProxyError::store(format!("Corrupt accounts file {}: {}", self.path.display(), e))
        })
    }

    async fn write_all(&self, credentials: &[Credential]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).await?;
            }
        }

        let content = serde_json::to_string_pretty(credentials)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), count = credentials.len(), "Accounts saved");
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn list(&self) -> Result<Vec<Credential>> {
        self.read_all().await
    }

    #[instrument(skip(self, credential), fields(identity = %credential.identity))]
    async fn put(&self, credential: &Credential) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        upsert(&mut all, credential);
        self.write_all(&all).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, identity: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        let before = all.len();
        all.retain(|c| c.identity != identity);
        if all.len() != before {
            self.write_all(&all).await?;
        }
        Ok(())
    }
}
