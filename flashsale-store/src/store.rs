use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::{
    engine::{Engine, ReadOffset, StreamMessage},
    error::Result,
};

/// Cheap to clone handle over an [`Engine`], shared by every component.
#[derive(Clone)]
pub struct Store {
    pub(crate) engine: Box<dyn Engine>,
}

impl Store {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        Self {
            engine: Box::new(engine),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.engine.get(key).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.engine.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            _ => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.engine.set(key, value, ttl).await
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let value = serde_json::to_string(value)?;

        self.engine.set(key, &value, ttl).await
    }

    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.engine.set_nx(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.engine.delete(key).await
    }

    pub async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        self.engine.delete_if_eq(key, expected).await
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.engine.incr(key).await
    }

    pub async fn scard(&self, key: &str) -> Result<u64> {
        self.engine.scard(key).await
    }

    pub async fn seckill(&self, voucher_id: &str, user_id: &str, order_id: &str) -> Result<i64> {
        self.engine.seckill(voucher_id, user_id, order_id).await
    }

    pub async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        self.engine.create_group(stream, group).await
    }

    pub async fn add(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        self.engine.add(stream, fields).await
    }

    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
        offset: ReadOffset,
    ) -> Result<Vec<StreamMessage>> {
        self.engine
            .read_group(stream, group, consumer, count, block, offset)
            .await
    }

    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool> {
        self.engine.ack(stream, group, id).await
    }

    pub async fn pending(&self, stream: &str, group: &str) -> Result<u64> {
        self.engine.pending(stream, group).await
    }
}
