use crate::error::{Error, Result, StoreError};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Key prefix of cached sharding entries.
pub const SHARDING_ENTRY_PREFIX: &str = "ShardingEntry-";
/// Key prefix of cached per-user packed permissions.
pub const USER_PERMISSIONS_PREFIX: &str = "UserPermissions-";
/// Key prefix of tenants that are down for maintenance.
pub const TENANT_DOWN_PREFIX: &str = "TenantDown-";

/// Distributed key-value cache shared by every application instance.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Gets a value.
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError>;

    /// Sets a value, replacing any previous one.
    async fn set(&self, key: &str, value: String) -> std::result::Result<(), StoreError>;

    /// Sets several values at once.
    async fn set_many(&self, entries: Vec<(String, String)>)
    -> std::result::Result<(), StoreError>;

    /// Removes a value; removing a missing key is not an error.
    async fn remove(&self, key: &str) -> std::result::Result<(), StoreError>;

    /// Returns every key starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str)
    -> std::result::Result<Vec<String>, StoreError>;
}

macro_rules! forward_cache {
    (impl<$($lt:lifetime,)? $t:ident> $target:ty) => {
        #[async_trait]
        impl<$($lt,)? $t: DistributedCache + ?Sized> DistributedCache for $target {
            async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
                (**self).get(key).await
            }

            async fn set(&self, key: &str, value: String) -> std::result::Result<(), StoreError> {
                (**self).set(key, value).await
            }

            async fn set_many(
                &self,
                entries: Vec<(String, String)>,
            ) -> std::result::Result<(), StoreError> {
                (**self).set_many(entries).await
            }

            async fn remove(&self, key: &str) -> std::result::Result<(), StoreError> {
                (**self).remove(key).await
            }

            async fn keys_with_prefix(
                &self,
                prefix: &str,
            ) -> std::result::Result<Vec<String>, StoreError> {
                (**self).keys_with_prefix(prefix).await
            }
        }
    };
}

forward_cache!(impl<T> Arc<T>);
forward_cache!(impl<'a, T> &'a T);

/// JSON class helpers on top of [`DistributedCache`].
#[async_trait]
pub trait DistributedCacheExt: DistributedCache {
    /// Gets and deserializes a value.
    async fn get_class<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| Error::Store(Box::new(err)))
    }

    /// Serializes and sets a value.
    async fn set_class<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value).map_err(|err| Error::Store(Box::new(err)))?;
        self.set(key, raw).await.map_err(Error::from)
    }

    /// Serializes and sets several values.
    async fn set_many_classes<T>(&self, entries: &[(String, T)]) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let mut raw = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let json =
                serde_json::to_string(value).map_err(|err| Error::Store(Box::new(err)))?;
            raw.push((key.clone(), json));
        }
        self.set_many(raw).await.map_err(Error::from)
    }
}

impl<T: DistributedCache + ?Sized> DistributedCacheExt for T {}

/// Returns the cache key of a sharding entry.
pub fn sharding_entry_key(name: &str) -> String {
    format!("{SHARDING_ENTRY_PREFIX}{name}")
}

/// Returns the cache key of a user's packed permissions.
pub fn user_permissions_key(user: &str) -> String {
    format!("{USER_PERMISSIONS_PREFIX}{user}")
}

/// Returns the cache key marking a tenant as down.
pub fn tenant_down_key(data_key: &str) -> String {
    format!("{TENANT_DOWN_PREFIX}{data_key}")
}

/// Cache that stores nothing.
///
/// Every read misses, so the engine recomputes permissions per request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl DistributedCache for NoCache {
    async fn get(&self, _key: &str) -> std::result::Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    async fn set_many(
        &self,
        _entries: Vec<(String, String)>,
    ) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    async fn keys_with_prefix(
        &self,
        _prefix: &str,
    ) -> std::result::Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}
