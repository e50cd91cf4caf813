//! Document-store adapter over Redis.
//!
//! The program state is small and relational lookups are all by key, so the
//! layout is plain: JSON documents under string keys, per-affiliate counters
//! in a hash mutated only through `HINCRBY`, and membership indexes as sets.
//!
//! Three primitives carry every consistency requirement:
//! - `insert_doc` (`SET NX`) for uniqueness guards (referral codes, the
//!   registration idempotency key),
//! - `update_doc` (`WATCH`/`MULTI`/`EXEC` retry loop) for status transitions,
//! - `reserve` (watched conditional decrement) for the payout balance check.
//!
//! An in-memory variant backs unit tests; it serializes everything behind one
//! mutex, which is strictly stronger than what Redis provides.

use std::time::Duration;

use redis::{
    AsyncCommands, Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::AppError;

/// Attempts for an optimistic transaction before giving up with a conflict.
const TX_RETRIES: usize = 8;

pub async fn init_redis(redis_url: &str) -> RedisStore {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url).unwrap();
    let connection = client
        .get_connection_manager_with_config(config)
        .await
        .unwrap();

    RedisStore { client, connection }
}

#[derive(Clone)]
pub enum Store {
    Redis(RedisStore),
    #[cfg(test)]
    Memory(memory::MemoryStore),
}

impl Store {
    pub fn redis(store: RedisStore) -> Self {
        Store::Redis(store)
    }

    #[cfg(test)]
    pub fn memory() -> Self {
        Store::Memory(memory::MemoryStore::default())
    }

    /// Test hook: makes every operation fail as if the store were
    /// unreachable.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        if let Store::Memory(m) = self {
            m.set_offline(offline);
        }
    }

    pub async fn get_doc<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        match self {
            Store::Redis(r) => r.get_doc(key).await,
            #[cfg(test)]
            Store::Memory(m) => m.get_doc(key),
        }
    }

    pub async fn put_doc<T: Serialize>(&self, key: &str, doc: &T) -> Result<(), AppError> {
        match self {
            Store::Redis(r) => r.put_doc(key, doc).await,
            #[cfg(test)]
            Store::Memory(m) => m.put_doc(key, doc),
        }
    }

    /// Like [`Store::put_doc`] but the key expires after `ttl_seconds`.
    pub async fn put_doc_ttl<T: Serialize>(
        &self,
        key: &str,
        doc: &T,
        ttl_seconds: u64,
    ) -> Result<(), AppError> {
        match self {
            Store::Redis(r) => r.put_doc_ttl(key, doc, ttl_seconds).await,
            #[cfg(test)]
            Store::Memory(m) => m.put_doc_ttl(key, doc, ttl_seconds),
        }
    }

    /// Test hook: the TTL recorded for a key, if any.
    #[cfg(test)]
    pub fn recorded_ttl(&self, key: &str) -> Option<u64> {
        match self {
            Store::Redis(_) => None,
            Store::Memory(m) => m.recorded_ttl(key),
        }
    }

    /// Conditional insert. Returns false, writing nothing, if the key already
    /// exists.
    pub async fn insert_doc<T: Serialize>(&self, key: &str, doc: &T) -> Result<bool, AppError> {
        match self {
            Store::Redis(r) => r.insert_doc(key, doc).await,
            #[cfg(test)]
            Store::Memory(m) => m.insert_doc(key, doc),
        }
    }

    /// Optimistic read-check-write on one document. `apply` sees the current
    /// value and returns the replacement; an `Err` aborts without writing.
    /// Contending writers retry; persistent contention surfaces as
    /// [`AppError::Conflict`].
    pub async fn update_doc<T, F>(&self, key: &str, mut apply: F) -> Result<T, AppError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> Result<T, AppError>,
    {
        self.update_doc_with_counters(key, |doc| apply(doc).map(|next| (next, Vec::new())))
            .await
    }

    /// [`Store::update_doc`] plus counter increments committed in the same
    /// transaction as the document write, so a status transition and its
    /// balance movements land all-or-nothing. `apply` returns the replacement
    /// document together with (counter key, field, delta) increments.
    pub async fn update_doc_with_counters<T, F>(&self, key: &str, apply: F) -> Result<T, AppError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> Result<(T, Vec<(String, &'static str, i64)>), AppError>,
    {
        match self {
            Store::Redis(r) => r.update_doc_with_counters(key, apply).await,
            #[cfg(test)]
            Store::Memory(m) => m.update_doc_with_counters(key, apply),
        }
    }

    /// Atomic counter increment on a hash field.
    pub async fn incr(&self, key: &str, field: &str, by: i64) -> Result<i64, AppError> {
        match self {
            Store::Redis(r) => r.incr(key, field, by).await,
            #[cfg(test)]
            Store::Memory(m) => m.incr(key, field, by),
        }
    }

    pub async fn counter(&self, key: &str, field: &str) -> Result<i64, AppError> {
        match self {
            Store::Redis(r) => r.counter(key, field).await,
            #[cfg(test)]
            Store::Memory(m) => m.counter(key, field),
        }
    }

    pub async fn counters(
        &self,
        key: &str,
    ) -> Result<std::collections::HashMap<String, i64>, AppError> {
        match self {
            Store::Redis(r) => r.counters(key).await,
            #[cfg(test)]
            Store::Memory(m) => m.counters(key),
        }
    }

    /// Conditional decrement: subtracts `amount` from the field only if the
    /// balance covers it, as one atomic step. Returns false, changing
    /// nothing, when it does not.
    pub async fn reserve(&self, key: &str, field: &str, amount: i64) -> Result<bool, AppError> {
        match self {
            Store::Redis(r) => r.reserve(key, field, amount).await,
            #[cfg(test)]
            Store::Memory(m) => m.reserve(key, field, amount),
        }
    }

    pub async fn index_add(&self, key: &str, member: &str) -> Result<(), AppError> {
        match self {
            Store::Redis(r) => r.index_add(key, member).await,
            #[cfg(test)]
            Store::Memory(m) => m.index_add(key, member),
        }
    }

    pub async fn index_members(&self, key: &str) -> Result<Vec<String>, AppError> {
        match self {
            Store::Redis(r) => r.index_members(key).await,
            #[cfg(test)]
            Store::Memory(m) => m.index_members(key),
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
}

impl RedisStore {
    /// WATCH state is per-connection in Redis, and the shared
    /// `ConnectionManager` multiplexes every request onto one connection —
    /// an `EXEC` there would clear the watches of every in-flight
    /// transaction. Each WATCH/MULTI/EXEC therefore runs on its own
    /// connection.
    async fn transaction_connection(
        &self,
    ) -> Result<redis::aio::MultiplexedConnection, AppError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn get_doc<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        let mut con = self.connection.clone();
        let raw: Option<String> = con.get(key).await?;

        Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
    }

    async fn put_doc<T: Serialize>(&self, key: &str, doc: &T) -> Result<(), AppError> {
        let mut con = self.connection.clone();
        let payload = serde_json::to_string(doc)?;
        let _: () = con.set(key, payload).await?;

        Ok(())
    }

    async fn put_doc_ttl<T: Serialize>(
        &self,
        key: &str,
        doc: &T,
        ttl_seconds: u64,
    ) -> Result<(), AppError> {
        let mut con = self.connection.clone();
        let payload = serde_json::to_string(doc)?;
        let _: () = con.set_ex(key, payload, ttl_seconds).await?;

        Ok(())
    }

    async fn insert_doc<T: Serialize>(&self, key: &str, doc: &T) -> Result<bool, AppError> {
        let mut con = self.connection.clone();
        let payload = serde_json::to_string(doc)?;
        let created: bool = con.set_nx(key, payload).await?;

        Ok(created)
    }

    async fn update_doc_with_counters<T, F>(&self, key: &str, mut apply: F) -> Result<T, AppError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> Result<(T, Vec<(String, &'static str, i64)>), AppError>,
    {
        let mut con = self.transaction_connection().await?;

        for _ in 0..TX_RETRIES {
            let _: () = redis::cmd("WATCH").arg(key).query_async(&mut con).await?;

            let raw: Option<String> = con.get(key).await?;
            let current = raw.as_deref().map(serde_json::from_str).transpose()?;

            let (next, increments) = match apply(current) {
                Ok(outcome) => outcome,
                Err(e) => {
                    let _: () = redis::cmd("UNWATCH").query_async(&mut con).await?;
                    return Err(e);
                }
            };

            let payload = serde_json::to_string(&next)?;
            let mut pipe = redis::pipe();
            pipe.atomic().set(key, payload).ignore();
            for (counter_key, field, delta) in &increments {
                pipe.hincr(counter_key, *field, *delta).ignore();
            }
            let committed: Option<()> = pipe.query_async(&mut con).await?;

            // None means the watched key changed under us; retry.
            if committed.is_some() {
                return Ok(next);
            }
        }

        Err(AppError::Conflict)
    }

    async fn incr(&self, key: &str, field: &str, by: i64) -> Result<i64, AppError> {
        let mut con = self.connection.clone();
        let value: i64 = con.hincr(key, field, by).await?;

        Ok(value)
    }

    async fn counter(&self, key: &str, field: &str) -> Result<i64, AppError> {
        let mut con = self.connection.clone();
        let value: Option<i64> = con.hget(key, field).await?;

        Ok(value.unwrap_or(0))
    }

    async fn counters(
        &self,
        key: &str,
    ) -> Result<std::collections::HashMap<String, i64>, AppError> {
        let mut con = self.connection.clone();
        let values: std::collections::HashMap<String, i64> = con.hgetall(key).await?;

        Ok(values)
    }

    async fn reserve(&self, key: &str, field: &str, amount: i64) -> Result<bool, AppError> {
        let mut con = self.transaction_connection().await?;

        for _ in 0..TX_RETRIES {
            let _: () = redis::cmd("WATCH").arg(key).query_async(&mut con).await?;

            let available: Option<i64> = con.hget(key, field).await?;
            if available.unwrap_or(0) < amount {
                let _: () = redis::cmd("UNWATCH").query_async(&mut con).await?;
                return Ok(false);
            }

            let committed: Option<()> = redis::pipe()
                .atomic()
                .hincr(key, field, -amount)
                .ignore()
                .query_async(&mut con)
                .await?;

            if committed.is_some() {
                return Ok(true);
            }
        }

        Err(AppError::Conflict)
    }

    async fn index_add(&self, key: &str, member: &str) -> Result<(), AppError> {
        let mut con = self.connection.clone();
        let _: () = con.sadd(key, member).await?;

        Ok(())
    }

    async fn index_members(&self, key: &str) -> Result<Vec<String>, AppError> {
        let mut con = self.connection.clone();
        let members: Vec<String> = con.smembers(key).await?;

        Ok(members)
    }
}

#[cfg(test)]
pub mod memory {
    use std::{
        collections::{BTreeSet, HashMap},
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    use serde::{Serialize, de::DeserializeOwned};

    use crate::error::AppError;

    #[derive(Clone, Default)]
    pub struct MemoryStore {
        inner: Arc<Mutex<Inner>>,
        offline: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct Inner {
        docs: HashMap<String, String>,
        hashes: HashMap<String, HashMap<String, i64>>,
        sets: HashMap<String, BTreeSet<String>>,
        /// Recorded for assertions; the memory store never actually expires
        /// keys, validity is always re-checked from document timestamps.
        ttls: HashMap<String, u64>,
    }

    impl MemoryStore {
        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn check_online(&self) -> Result<(), AppError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(AppError::Internal("store unreachable".into()));
            }

            Ok(())
        }

        pub fn get_doc<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
            self.check_online()?;
            let inner = self.inner.lock().unwrap();

            Ok(inner
                .docs
                .get(key)
                .map(|raw| serde_json::from_str(raw))
                .transpose()?)
        }

        pub fn put_doc<T: Serialize>(&self, key: &str, doc: &T) -> Result<(), AppError> {
            self.check_online()?;
            let payload = serde_json::to_string(doc)?;
            self.inner.lock().unwrap().docs.insert(key.to_string(), payload);

            Ok(())
        }

        pub fn put_doc_ttl<T: Serialize>(
            &self,
            key: &str,
            doc: &T,
            ttl_seconds: u64,
        ) -> Result<(), AppError> {
            self.check_online()?;
            let payload = serde_json::to_string(doc)?;
            let mut inner = self.inner.lock().unwrap();
            inner.docs.insert(key.to_string(), payload);
            inner.ttls.insert(key.to_string(), ttl_seconds);

            Ok(())
        }

        pub fn recorded_ttl(&self, key: &str) -> Option<u64> {
            self.inner.lock().unwrap().ttls.get(key).copied()
        }

        pub fn insert_doc<T: Serialize>(&self, key: &str, doc: &T) -> Result<bool, AppError> {
            self.check_online()?;
            let payload = serde_json::to_string(doc)?;
            let mut inner = self.inner.lock().unwrap();

            if inner.docs.contains_key(key) {
                return Ok(false);
            }

            inner.docs.insert(key.to_string(), payload);
            Ok(true)
        }

        pub fn update_doc_with_counters<T, F>(&self, key: &str, mut apply: F) -> Result<T, AppError>
        where
            T: Serialize + DeserializeOwned,
            F: FnMut(Option<T>) -> Result<(T, Vec<(String, &'static str, i64)>), AppError>,
        {
            self.check_online()?;
            let mut inner = self.inner.lock().unwrap();

            let current = inner
                .docs
                .get(key)
                .map(|raw| serde_json::from_str(raw))
                .transpose()?;

            // Document write and counter movements land under the same lock,
            // mirroring the single MULTI/EXEC of the Redis backend.
            let (next, increments) = apply(current)?;
            inner.docs.insert(key.to_string(), serde_json::to_string(&next)?);
            for (counter_key, field, delta) in increments {
                *inner
                    .hashes
                    .entry(counter_key)
                    .or_default()
                    .entry(field.to_string())
                    .or_insert(0) += delta;
            }

            Ok(next)
        }

        pub fn incr(&self, key: &str, field: &str, by: i64) -> Result<i64, AppError> {
            self.check_online()?;
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .hashes
                .entry(key.to_string())
                .or_default()
                .entry(field.to_string())
                .or_insert(0);
            *entry += by;

            Ok(*entry)
        }

        pub fn counter(&self, key: &str, field: &str) -> Result<i64, AppError> {
            self.check_online()?;
            let inner = self.inner.lock().unwrap();

            Ok(inner
                .hashes
                .get(key)
                .and_then(|h| h.get(field))
                .copied()
                .unwrap_or(0))
        }

        pub fn counters(&self, key: &str) -> Result<HashMap<String, i64>, AppError> {
            self.check_online()?;
            let inner = self.inner.lock().unwrap();

            Ok(inner.hashes.get(key).cloned().unwrap_or_default())
        }

        pub fn reserve(&self, key: &str, field: &str, amount: i64) -> Result<bool, AppError> {
            self.check_online()?;
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .hashes
                .entry(key.to_string())
                .or_default()
                .entry(field.to_string())
                .or_insert(0);

            if *entry < amount {
                return Ok(false);
            }

            *entry -= amount;
            Ok(true)
        }

        pub fn index_add(&self, key: &str, member: &str) -> Result<(), AppError> {
            self.check_online()?;
            self.inner
                .lock()
                .unwrap()
                .sets
                .entry(key.to_string())
                .or_default()
                .insert(member.to_string());

            Ok(())
        }

        pub fn index_members(&self, key: &str) -> Result<Vec<String>, AppError> {
            self.check_online()?;
            let inner = self.inner.lock().unwrap();

            Ok(inner
                .sets
                .get(key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default())
        }
    }
}
