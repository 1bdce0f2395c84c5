use ::redis::{
    aio::ConnectionManager,
    streams::{StreamPendingReply, StreamReadOptions, StreamReadReply},
    AsyncCommands, Client, RedisResult, Script,
};
use async_trait::async_trait;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, info};

use crate::{
    engine::{Engine, ReadOffset, StreamMessage},
    error::Result,
    keys,
    store::Store,
};

const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
"#;

fn seckill_script() -> String {
    format!(
        r#"
local voucherId = ARGV[1]
local userId = ARGV[2]
local orderId = ARGV[3]

local stockKey = '{stock}' .. voucherId
local orderKey = '{order}' .. voucherId

local stock = tonumber(redis.call('get', stockKey))
if stock == nil or stock <= 0 then
    return 1
end

if redis.call('sismember', orderKey, userId) == 1 then
    return 2
end

redis.call('incrby', stockKey, -1)
redis.call('sadd', orderKey, userId)
redis.call('xadd', '{stream}', '*', 'userId', userId, 'voucherId', voucherId, 'id', orderId)

return 0
"#,
        stock = keys::SECKILL_STOCK_KEY,
        order = keys::SECKILL_ORDER_KEY,
        stream = keys::ORDER_STREAM,
    )
}

/// Engine backed by a Redis server. Scripts run server side, so admission and
/// lock release stay single indivisible operations.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    seckill: Script,
    unlock: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Store {
        Store::new(Self {
            conn,
            seckill: Script::new(&seckill_script()),
            unlock: Script::new(UNLOCK_SCRIPT),
        })
    }

    pub async fn connect(url: &str) -> Result<Store> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("connected to redis at {url}");

        Ok(Self::new(conn))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl Engine for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);

        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }

        let _: () = cmd.query_async(&mut conn).await?;

        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;

        Ok(removed > 0)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .unlock
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;

        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;

        Ok(value)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.scard(key).await?;

        Ok(len)
    }

    async fn seckill(&self, voucher_id: &str, user_id: &str, order_id: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let status: i64 = self
            .seckill
            .arg(voucher_id)
            .arg(user_id)
            .arg(order_id)
            .invoke_async(&mut conn)
            .await?;

        Ok(status)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let res: RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;

        match res {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("consumer group {group} already exists on {stream}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn add(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;

        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
        offset: ReadOffset,
    ) -> Result<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        if let (Some(block), ReadOffset::New) = (block, offset) {
            opts = opts.block(usize::try_from(block.as_millis()).unwrap_or(usize::MAX));
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[offset.as_id()], &opts)
            .await?;

        let mut messages = Vec::new();

        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                let mut fields = HashMap::with_capacity(entry.map.len());

                for (field, value) in entry.map.iter() {
                    let value: String = ::redis::from_redis_value(value)?;
                    fields.insert(field.to_owned(), value);
                }

                messages.push(StreamMessage {
                    id: entry.id,
                    fields,
                });
            }
        }

        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acked: u64 = conn.xack(stream, group, &[id]).await?;

        Ok(acked > 0)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(stream, group).await?;

        Ok(u64::try_from(reply.count()).unwrap_or(u64::MAX))
    }
}
