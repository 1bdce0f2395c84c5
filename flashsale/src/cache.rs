use chrono::{DateTime, Utc};
use flashsale_store::Store;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::HashMap, fmt::Display, future::Future, sync::Arc, time::Duration};
use tokio::{
    runtime::Handle,
    sync::{Mutex as AsyncMutex, Semaphore},
    time::sleep,
};
use tracing::{debug, error, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    lock::{Lock, LockToken},
};

/// How a key prefix is protected against penetration, breakdown and stampedes.
///
/// A prefix must keep the same strategy for its whole life; entries written
/// by one strategy are not readable by another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Missing entities are remembered with a short-lived empty marker.
    /// Concurrent misses inside this process share one load.
    #[default]
    NullCache,
    /// Misses rebuild under a per-key distributed lock; losers wait and look again.
    Mutex,
    /// Entries never expire in the store; an embedded deadline triggers a
    /// single background rebuild while readers keep getting the stale value.
    LogicalExpire,
}

#[derive(Serialize, Deserialize)]
struct LogicalEntry<T> {
    data: Option<T>,
    expire_time: DateTime<Utc>,
}

enum Cached<T> {
    Miss,
    Fresh(Option<T>),
    Expired(Option<T>),
}

/// Read-through cache over the shared store.
#[derive(Clone)]
pub struct CacheClient {
    store: Store,
    lock: Lock,
    config: Config,
    strategies: Arc<HashMap<String, CacheStrategy>>,
    inflight: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    rebuilds: Arc<Semaphore>,
}

impl CacheClient {
    pub fn new(store: Store, config: Config) -> Self {
        Self {
            lock: Lock::new(store.clone()),
            store,
            rebuilds: Arc::new(Semaphore::new(config.rebuild_workers.max(1))),
            config,
            strategies: Default::default(),
            inflight: Default::default(),
        }
    }

    pub fn strategy(mut self, key_prefix: impl Into<String>, strategy: CacheStrategy) -> Self {
        Arc::make_mut(&mut self.strategies).insert(key_prefix.into(), strategy);

        self
    }

    pub fn strategy_of(&self, key_prefix: &str) -> CacheStrategy {
        self.strategies
            .get(key_prefix)
            .copied()
            .unwrap_or_default()
    }

    /// Returns the entity cached under `<key_prefix><id>`, calling `loader` on a
    /// miss according to the prefix strategy. `Ok(None)` means the entity does
    /// not exist. Loader errors are never cached.
    pub async fn get_or_load<T, ID, F, Fut>(
        &self,
        key_prefix: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        ID: Display + Clone + Send + Sync + 'static,
        F: Fn(ID) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        let key = format!("{key_prefix}{id}");

        match self.strategy_of(key_prefix) {
            CacheStrategy::NullCache => self.query_with_pass_through(&key, id, loader, ttl).await,
            CacheStrategy::Mutex => {
                self.query_with_mutex(&key, id, loader, ttl, CacheStrategy::Mutex)
                    .await
            }
            CacheStrategy::LogicalExpire => {
                self.query_with_logical_expire(&key, id, loader, ttl)
                    .await
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        self.write(key, Some(value), ttl, CacheStrategy::NullCache)
            .await
    }

    /// Warms a key for the [`CacheStrategy::LogicalExpire`] strategy.
    pub async fn set_with_logical_expire<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        self.write(key, Some(value), ttl, CacheStrategy::LogicalExpire)
            .await
    }

    /// Drops `<key_prefix><id>` after the entity changed in the backing store.
    pub async fn invalidate(&self, key_prefix: &str, id: impl Display) -> Result<bool> {
        Ok(self.store.delete(&format!("{key_prefix}{id}")).await?)
    }

    async fn query_with_pass_through<T, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(ID) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let strategy = CacheStrategy::NullCache;

        if let Cached::Fresh(value) | Cached::Expired(value) = self.read(key, strategy).await? {
            return Ok(value);
        }

        let flight = self.flight(key);
        let guard = flight.lock().await;
        let result = self.rebuild(key, id, &loader, ttl, strategy).await;
        drop(guard);
        self.land(key, &flight);

        result
    }

    async fn query_with_mutex<T, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: F,
        ttl: Duration,
        strategy: CacheStrategy,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        ID: Clone,
        F: Fn(ID) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let resource = format!("cache:{key}");

        for _ in 0..=self.config.mutex_max_retries {
            if let Cached::Fresh(value) | Cached::Expired(value) = self.read(key, strategy).await? {
                return Ok(value);
            }

            let guard = match self
                .lock
                .try_acquire(&resource, self.config.cache_lock_ttl)
                .await
            {
                Ok(token) => RebuildLock::new(self.lock.clone(), token),
                Err(Error::AlreadyHeld(_)) => {
                    sleep(self.config.mutex_retry_delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let result = self.rebuild(key, id, &loader, ttl, strategy).await;
            guard.release().await;

            return result;
        }

        warn!("gave up waiting for the rebuild of {key}, loading without the cache");

        loader(id).await.map_err(Error::Loader)
    }

    async fn query_with_logical_expire<T, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        ID: Display + Clone + Send + Sync + 'static,
        F: Fn(ID) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        let strategy = CacheStrategy::LogicalExpire;

        let stale = match self.read::<T>(key, strategy).await? {
            Cached::Fresh(value) => return Ok(value),
            Cached::Miss => {
                return self.query_with_mutex(key, id, loader, ttl, strategy).await;
            }
            Cached::Expired(value) => value,
        };

        let guard = match self
            .lock
            .try_acquire(&format!("cache:{key}"), self.config.cache_lock_ttl)
            .await
        {
            Ok(token) => RebuildLock::new(self.lock.clone(), token),
            Err(Error::AlreadyHeld(_)) => return Ok(stale),
            Err(e) => {
                error!("failed to lock the rebuild of {key}, serving stale value: {e}");
                return Ok(stale);
            }
        };

        let client = self.clone();
        let key = key.to_owned();

        tokio::spawn(async move {
            match client.rebuilds.clone().acquire_owned().await {
                Ok(_permit) => match client.rebuild(&key, id, &loader, ttl, strategy).await {
                    Ok(_) => debug!("rebuilt logically expired {key}"),
                    Err(e) => error!("failed to rebuild {key}, keeping stale value: {e}"),
                },
                Err(e) => error!("rebuild pool closed, {key} stays stale: {e}"),
            };

            guard.release().await;
        });

        Ok(stale)
    }

    /// Loads and writes `key` unless a fresh value landed while the caller
    /// waited for its turn.
    async fn rebuild<T, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: &F,
        ttl: Duration,
        strategy: CacheStrategy,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(ID) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        if let Cached::Fresh(value) = self.read(key, strategy).await? {
            return Ok(value);
        }

        let value = loader(id).await.map_err(Error::Loader)?;
        self.write(key, value.as_ref(), ttl, strategy).await?;

        Ok(value)
    }

    async fn read<T: DeserializeOwned>(
        &self,
        key: &str,
        strategy: CacheStrategy,
    ) -> Result<Cached<T>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(Cached::Miss);
        };

        match strategy {
            CacheStrategy::NullCache | CacheStrategy::Mutex => {
                if raw.is_empty() {
                    return Ok(Cached::Fresh(None));
                }

                Ok(Cached::Fresh(Some(serde_json::from_str(&raw)?)))
            }
            CacheStrategy::LogicalExpire => {
                let entry = serde_json::from_str::<LogicalEntry<T>>(&raw)?;

                if entry.expire_time > Utc::now() {
                    Ok(Cached::Fresh(entry.data))
                } else {
                    Ok(Cached::Expired(entry.data))
                }
            }
        }
    }

    async fn write<T: Serialize>(
        &self,
        key: &str,
        value: Option<&T>,
        ttl: Duration,
        strategy: CacheStrategy,
    ) -> Result<()> {
        match (strategy, value) {
            (CacheStrategy::LogicalExpire, data) => {
                let expire_time = Utc::now()
                    + chrono::Duration::from_std(ttl).map_err(|e| anyhow::anyhow!(e))?;

                self.store
                    .set_json(key, &LogicalEntry { data, expire_time }, None)
                    .await?;
            }
            (_, Some(value)) => self.store.set_json(key, value, Some(ttl)).await?,
            (_, None) => {
                self.store
                    .set(key, "", Some(self.config.cache_null_ttl))
                    .await?
            }
        };

        Ok(())
    }

    fn flight(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.inflight
            .lock()
            .entry(key.to_owned())
            .or_default()
            .clone()
    }

    fn land(&self, key: &str, flight: &Arc<AsyncMutex<()>>) {
        let mut inflight = self.inflight.lock();

        let idle = inflight
            .get(key)
            .is_some_and(|f| Arc::ptr_eq(f, flight) && Arc::strong_count(f) <= 2);

        if idle {
            inflight.remove(key);
        }
    }
}

/// Holds a rebuild lock. Dropping it without [`RebuildLock::release`], on
/// cancellation or a panicking loader, releases the lock from a spawned task.
struct RebuildLock {
    lock: Lock,
    token: Option<LockToken>,
}

impl RebuildLock {
    fn new(lock: Lock, token: LockToken) -> Self {
        Self {
            lock,
            token: Some(token),
        }
    }

    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            release(&self.lock, &token).await;
        }
    }
}

impl Drop for RebuildLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        let lock = self.lock.clone();

        match Handle::try_current() {
            Ok(handle) => {
                debug!("rebuild of {} interrupted, releasing", token.resource());
                handle.spawn(async move { release(&lock, &token).await });
            }
            Err(e) => warn!("{} left to expire: {e}", token.resource()),
        };
    }
}

async fn release(lock: &Lock, token: &LockToken) {
    match lock.release(token).await {
        Ok(()) | Err(Error::NotOwner(_)) => {}
        Err(e) => error!("failed to release {}: {e}", token.resource()),
    }
}
