//! Cache Metadata Index.
//!
//! Binds an upstream-native context-cache handle to the local key id that
//! created it ("owning key"), without the owning key ever pointing back at
//! the handle. Breaking that back-pointer means key records never carry a
//! variable-length collection of cache handles, so disabling or evicting a
//! key never requires walking every handle it ever created — an orphaned
//! handle is simply treated as expired the next time it's looked up.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::types::Credential;

/// A cached-content handle minted by an upstream provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHandle {
    pub local_id: String,
    pub upstream_cache_id: String,
    pub content_hash: String,
    pub owning_key_id: String,
    pub credential: Credential,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheHandle {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

enum Backend {
    Memory(Mutex<HashMap<String, CacheHandle>>),
    Sqlite(Pool<SqliteConnectionManager>),
}

/// Tracks cache handles independently of the upstream key pool. A handle
/// whose owning key has since been removed is not deleted outright — it's
/// surfaced as expired so the dispatch pipeline falls through to minting a
/// fresh cache rather than erroring.
pub struct CacheIndex {
    backend: Backend,
}

impl CacheIndex {
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(HashMap::new())),
        }
    }

    pub fn sqlite(pool: Pool<SqliteConnectionManager>) -> Self {
        Self {
            backend: Backend::Sqlite(pool),
        }
    }

    /// Find a live, non-expired handle for this credential + content hash.
    pub async fn find_by_content(
        &self,
        credential: &Credential,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<CacheHandle>> {
        match &self.backend {
            Backend::Memory(map) => {
                let map = map.lock().expect("cache index mutex poisoned");
                Ok(map
                    .values()
                    .find(|h| {
                        h.credential == *credential
                            && h.content_hash == content_hash
                            && !h.is_expired(now)
                    })
                    .cloned())
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                let credential = credential.clone();
                let content_hash = content_hash.to_string();
                tokio::task::spawn_blocking(move || {
                    let handles = crate::storage::sqlite::load_cache_handles(&pool)?;
                    Ok(handles
                        .into_iter()
                        .find(|h| {
                            h.credential == credential
                                && h.content_hash == content_hash
                                && !h.is_expired(now)
                        }))
                })
                .await?
            }
        }
    }

    /// List all live, non-expired handles owned by `credential`.
    pub async fn list_for_credential(
        &self,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CacheHandle>> {
        match &self.backend {
            Backend::Memory(map) => {
                let map = map.lock().expect("cache index mutex poisoned");
                Ok(map
                    .values()
                    .filter(|h| h.credential == *credential && !h.is_expired(now))
                    .cloned()
                    .collect())
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                let credential = credential.clone();
                tokio::task::spawn_blocking(move || {
                    let handles = crate::storage::sqlite::load_cache_handles(&pool)?;
                    Ok(handles
                        .into_iter()
                        .filter(|h| h.credential == credential && !h.is_expired(now))
                        .collect())
                })
                .await?
            }
        }
    }

    pub async fn register(&self, handle: CacheHandle) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Memory(map) => {
                map.lock()
                    .expect("cache index mutex poisoned")
                    .insert(handle.local_id.clone(), handle);
                Ok(())
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                tokio::task::spawn_blocking(move || crate::storage::sqlite::insert_cache_handle(&pool, &handle))
                    .await?
            }
        }
    }

    /// Return the owning key id for a handle, or `None` if the handle no
    /// longer exists or has expired.
    pub async fn owning_key(&self, local_id: &str, now: DateTime<Utc>) -> anyhow::Result<Option<String>> {
        match &self.backend {
            Backend::Memory(map) => {
                let map = map.lock().expect("cache index mutex poisoned");
                Ok(map
                    .get(local_id)
                    .filter(|h| !h.is_expired(now))
                    .map(|h| h.owning_key_id.clone()))
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                let local_id = local_id.to_string();
                tokio::task::spawn_blocking(move || {
                    let handles = crate::storage::sqlite::load_cache_handles(&pool)?;
                    Ok(handles
                        .into_iter()
                        .find(|h| h.local_id == local_id && !h.is_expired(now))
                        .map(|h| h.owning_key_id))
                })
                .await?
            }
        }
    }

    /// Best-effort removal. Upstream deletion of the underlying provider
    /// cache is the caller's responsibility; this only drops local metadata.
    pub async fn delete(&self, local_id: &str) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Memory(map) => {
                map.lock().expect("cache index mutex poisoned").remove(local_id);
                Ok(())
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                let local_id = local_id.to_string();
                tokio::task::spawn_blocking(move || crate::storage::sqlite::delete_cache_handle(&pool, &local_id))
                    .await?
            }
        }
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        match &self.backend {
            Backend::Memory(map) => {
                let mut map = map.lock().expect("cache index mutex poisoned");
                let before = map.len();
                map.retain(|_, h| !h.is_expired(now));
                Ok(before - map.len())
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                tokio::task::spawn_blocking(move || {
                    let handles = crate::storage::sqlite::load_cache_handles(&pool)?;
                    let mut removed = 0;
                    for h in handles.into_iter().filter(|h| h.is_expired(now)) {
                        crate::storage::sqlite::delete_cache_handle(&pool, &h.local_id)?;
                        removed += 1;
                    }
                    Ok(removed)
                })
                .await?
            }
        }
    }

    /// Mark a handle expired in place without removing its row, used when an
    /// upstream call reports the cache handle is no longer valid.
    pub async fn mark_expired(&self, local_id: &str) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Memory(map) => {
                if let Some(h) = map.lock().expect("cache index mutex poisoned").get_mut(local_id) {
                    h.expires_at = Utc::now() - chrono::Duration::seconds(1);
                }
                Ok(())
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                let local_id = local_id.to_string();
                tokio::task::spawn_blocking(move || crate::storage::sqlite::expire_cache_handle(&pool, &local_id))
                    .await?
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(credential: &str, hash: &str, owner: &str, now: DateTime<Utc>) -> CacheHandle {
        CacheHandle {
            local_id: format!("{credential}-{hash}"),
            upstream_cache_id: "upstream-1".to_string(),
            content_hash: hash.to_string(),
            owning_key_id: owner.to_string(),
            credential: Credential::new(credential),
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn find_by_content_matches_credential_and_hash() {
        let index = CacheIndex::memory();
        let now = Utc::now();
        index.register(handle("c1", "h1", "k1", now)).await.unwrap();
        let found = index.find_by_content(&Credential::new("c1"), "h1", now).await.unwrap();
        assert!(found.is_some());
        assert!(index
            .find_by_content(&Credential::new("c2"), "h1", now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_handle_is_not_returned() {
        let index = CacheIndex::memory();
        let now = Utc::now();
        index.register(handle("c1", "h1", "k1", now)).await.unwrap();
        let later = now + chrono::Duration::hours(2);
        assert!(index
            .find_by_content(&Credential::new("c1"), "h1", later)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn owning_key_survives_independent_of_key_pool_state() {
        let index = CacheIndex::memory();
        let now = Utc::now();
        index.register(handle("c1", "h1", "k1", now)).await.unwrap();
        let owner = index.owning_key("c1-h1", now).await.unwrap();
        assert_eq!(owner, Some("k1".to_string()));
    }

    #[tokio::test]
    async fn list_for_credential_excludes_other_credentials_and_expired() {
        let index = CacheIndex::memory();
        let now = Utc::now();
        index.register(handle("c1", "h1", "k1", now)).await.unwrap();
        index.register(handle("c2", "h2", "k1", now)).await.unwrap();
        let mut expired = handle("c1", "h3", "k1", now);
        expired.expires_at = now - chrono::Duration::seconds(1);
        index.register(expired).await.unwrap();

        let listed = index.list_for_credential(&Credential::new("c1"), now).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content_hash, "h1");
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let index = CacheIndex::memory();
        let now = Utc::now();
        index.register(handle("c1", "h1", "k1", now)).await.unwrap();
        let mut expired = handle("c2", "h2", "k2", now);
        expired.expires_at = now - chrono::Duration::seconds(1);
        index.register(expired).await.unwrap();
        let removed = index.sweep_expired(now).await.unwrap();
        assert_eq!(removed, 1);
    }
}
