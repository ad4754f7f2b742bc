//! Persisted per-user quota overrides.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::UserQuota;
use crate::store::StoreError;
use crate::types::{Result, UserId};

/// Where administrator-set limits live. Users without an entry get the
/// configured defaults.
#[async_trait]
pub trait QuotaOverrideStore: Send + Sync + Debug {
    async fn get(&self, user: &UserId) -> Result<Option<UserQuota>>;

    async fn put(&self, user: &UserId, quota: &UserQuota) -> Result<()>;

    /// Drop an override. Returns true when one existed.
    async fn remove(&self, user: &UserId) -> Result<bool>;
}

/// Process-local overrides.
#[derive(Debug)]
pub struct InMemoryQuotaOverrides {
    quotas: RwLock<HashMap<UserId, UserQuota>>,
    available: AtomicBool,
}

impl Default for InMemoryQuotaOverrides {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQuotaOverrides {
    pub fn new() -> Self {
        Self {
            quotas: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("quota overrides offline".to_string()).into())
        }
    }
}

#[async_trait]
impl QuotaOverrideStore for InMemoryQuotaOverrides {
    async fn get(&self, user: &UserId) -> Result<Option<UserQuota>> {
        self.ensure_available()?;
        Ok(self.quotas.read().await.get(user).copied())
    }

    async fn put(&self, user: &UserId, quota: &UserQuota) -> Result<()> {
        self.ensure_available()?;
        self.quotas.write().await.insert(user.clone(), *quota);
        Ok(())
    }

    async fn remove(&self, user: &UserId) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.quotas.write().await.remove(user).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = InMemoryQuotaOverrides::new();
        let user = UserId::must("bob");
        assert_eq!(store.get(&user).await.unwrap(), None);

        let quota = UserQuota {
            max_cpu_cores: 8.0,
            ..Default::default()
        };
        store.put(&user, &quota).await.unwrap();
        assert_eq!(store.get(&user).await.unwrap(), Some(quota));
        assert!(store.remove(&user).await.unwrap());
        assert!(!store.remove(&user).await.unwrap());
    }

    #[tokio::test]
    async fn test_outage_surfaces_store_error() {
        let store = InMemoryQuotaOverrides::new();
        store.set_available(false);
        let err = store.get(&UserId::must("bob")).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Unavailable(_))));
        assert!(err.is_retryable());
    }
}
