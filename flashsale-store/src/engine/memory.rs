use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::Notify,
    time::{timeout_at, Instant},
};
use tracing::warn;

use crate::{
    engine::{Engine, ReadOffset, StreamMessage},
    error::{Result, StoreError},
    keys,
    store::Store,
};

/// In-process engine. Every operation, the admission script included, runs
/// under one write lock and is therefore indivisible.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    appended: Arc<Notify>,
}

impl MemoryStore {
    pub fn create() -> Store {
        Store::new(Self::default())
    }
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
    streams: HashMap<String, Stream>,
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct StreamId {
    ms: u64,
    seq: u64,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StoreError::InvalidMessage(format!("malformed stream id {s}"));
        let (ms, seq) = s.split_once('-').ok_or_else(invalid)?;

        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<StreamId, Vec<(String, String)>>,
    last_id: StreamId,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, String>,
}

impl Stream {
    fn append(&mut self, fields: Vec<(String, String)>) -> StreamId {
        let ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let id = if ms > self.last_id.ms {
            StreamId { ms, seq: 0 }
        } else {
            StreamId {
                ms: self.last_id.ms,
                seq: self.last_id.seq + 1,
            }
        };

        self.last_id = id;
        self.entries.insert(id, fields);

        id
    }
}

impl State {
    fn string(&mut self, key: &str) -> Option<&str> {
        let now = Instant::now();

        if self.strings.get(key).is_some_and(|e| !e.is_live(now)) {
            self.strings.remove(key);
        }

        self.strings.get(key).map(|e| e.value.as_str())
    }

    fn integer(&mut self, key: &str) -> Result<Option<i64>> {
        match self.string(key) {
            Some(value) => value
                .parse::<i64>()
                .map(Some)
                .map_err(|_| StoreError::NotAnInteger(key.to_owned())),
            _ => Ok(None),
        }
    }

    fn put(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        self.strings.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn deliver(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        offset: ReadOffset,
    ) -> Result<Vec<StreamMessage>> {
        let no_group = || StoreError::NoGroup {
            stream: stream.to_owned(),
            group: group.to_owned(),
        };

        let stream = self.streams.get_mut(stream).ok_or_else(no_group)?;
        let Stream {
            entries, groups, ..
        } = stream;
        let state = groups.get_mut(group).ok_or_else(no_group)?;

        let ids = match offset {
            ReadOffset::New => entries
                .range(state.last_delivered..)
                .map(|(id, _)| *id)
                .filter(|id| *id > state.last_delivered)
                .take(count)
                .collect::<Vec<_>>(),
            ReadOffset::Pending => state
                .pending
                .iter()
                .filter(|(_, owner)| owner.as_str() == consumer)
                .map(|(id, _)| *id)
                .take(count)
                .collect::<Vec<_>>(),
        };

        let mut messages = Vec::with_capacity(ids.len());

        for id in ids {
            if offset == ReadOffset::New {
                state.last_delivered = id;
                state.pending.insert(id, consumer.to_owned());
            }

            if let Some(fields) = entries.get(&id) {
                messages.push(StreamMessage {
                    id: id.to_string(),
                    fields: fields.iter().cloned().collect(),
                });
            }
        }

        Ok(messages)
    }
}

#[async_trait]
impl Engine for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.write().string(key).map(|v| v.to_owned()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.state.write().put(key, value.to_owned(), ttl);

        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.write();

        if state.string(key).is_some() {
            return Ok(false);
        }

        state.put(key, value.to_owned(), Some(ttl));

        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.write();
        let now = Instant::now();

        let string = state.strings.remove(key).is_some_and(|e| e.is_live(now));
        let set = state.sets.remove(key).is_some();
        let stream = state.streams.remove(key).is_some();

        Ok(string || set || stream)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let mut state = self.state.write();

        if state.string(key) != Some(expected) {
            return Ok(false);
        }

        state.strings.remove(key);

        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut state = self.state.write();
        let value = state.integer(key)?.unwrap_or(0) + 1;
        let expires_at = state.strings.get(key).and_then(|e| e.expires_at);

        state.strings.insert(
            key.to_owned(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );

        Ok(value)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let len = self.state.read().sets.get(key).map(|s| s.len()).unwrap_or(0);

        Ok(u64::try_from(len).unwrap_or(u64::MAX))
    }

    async fn seckill(&self, voucher_id: &str, user_id: &str, order_id: &str) -> Result<i64> {
        let stock_key = keys::stock(voucher_id);
        let order_key = keys::admitted(voucher_id);

        {
            let mut state = self.state.write();

            let stock = state.integer(&stock_key)?.unwrap_or(0);
            if stock < 0 {
                warn!("negative stock {stock} observed on voucher {voucher_id}");
            }

            if stock <= 0 {
                return Ok(1);
            }

            if state
                .sets
                .get(&order_key)
                .is_some_and(|users| users.contains(user_id))
            {
                return Ok(2);
            }

            let expires_at = state.strings.get(&stock_key).and_then(|e| e.expires_at);
            state.strings.insert(
                stock_key,
                Entry {
                    value: (stock - 1).to_string(),
                    expires_at,
                },
            );
            state
                .sets
                .entry(order_key)
                .or_default()
                .insert(user_id.to_owned());
            state
                .streams
                .entry(keys::ORDER_STREAM.to_owned())
                .or_default()
                .append(vec![
                    ("userId".to_owned(), user_id.to_owned()),
                    ("voucherId".to_owned(), voucher_id.to_owned()),
                    ("id".to_owned(), order_id.to_owned()),
                ]);
        }

        self.appended.notify_waiters();

        Ok(0)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        self.state
            .write()
            .streams
            .entry(stream.to_owned())
            .or_default()
            .groups
            .entry(group.to_owned())
            .or_default();

        Ok(())
    }

    async fn add(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let id = self
            .state
            .write()
            .streams
            .entry(stream.to_owned())
            .or_default()
            .append(fields.to_vec());

        self.appended.notify_waiters();

        Ok(id.to_string())
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
        let deadline = block.map(|block| Instant::now() + block);

        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let messages = self
                .state
                .write()
                .deliver(stream, group, consumer, count, offset)?;

            if !messages.is_empty() || offset == ReadOffset::Pending {
                return Ok(messages);
            }

            let Some(deadline) = deadline else {
                return Ok(messages);
            };

            if timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool> {
        let id = id.parse::<StreamId>()?;
        let mut state = self.state.write();

        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&id))
            .is_some();

        Ok(removed)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<u64> {
        let len = self
            .state
            .read()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0);

        Ok(u64::try_from(len).unwrap_or(u64::MAX))
    }
}
