//! Redis Streams broker backend.
//!
//! Each queue is a stream `herald:queue:<name>` read through the consumer group
//! [`CONSUMER_GROUP`]. Entries stay in the group's pending list until acknowledged,
//! so a worker that dies mid-message leaves it to be reclaimed by another worker
//! via `XAUTOCLAIM` once it has been idle for `claim_idle`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, FromRedisValue, RedisError, Value};

use herald_common::error::AppError;

use crate::backend::Broker;
use crate::message::{Delivery, Envelope};
use crate::topology::QueueSpec;

/// Consumer group shared by every delivery worker.
pub const CONSUMER_GROUP: &str = "herald-workers";

const KEY_PREFIX: &str = "herald:queue";

fn unavailable(e: RedisError) -> AppError {
    AppError::BrokerUnavailable(e.to_string())
}

/// `XREADGROUP BLOCK` argument for `wait`. `BLOCK 0` waits forever, so the floor is 1ms.
fn block_millis(wait: Duration) -> usize {
    wait.as_millis().clamp(1, usize::MAX as u128) as usize
}

/// Broker backend over Redis Streams consumer groups.
///
/// A blocking `receive` occupies the connection for up to its wait, delaying every
/// other command queued behind it. Give each consumer its own `RedisBroker`.
pub struct RedisBroker {
    con: ConnectionManager,
    claim_idle: Duration,
}

impl RedisBroker {
    pub fn new(con: ConnectionManager, claim_idle: Duration) -> Self {
        Self { con, claim_idle }
    }

    /// Open a dedicated connection for broker traffic.
    pub async fn connect(url: &str, claim_idle: Duration) -> Result<Self, AppError> {
        let client = Client::open(url).map_err(unavailable)?;
        let con = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self::new(con, claim_idle))
    }

    pub fn stream_key(queue: &str) -> String {
        format!("{}:{}", KEY_PREFIX, queue)
    }

    /// Take over entries another consumer left unacknowledged for too long.
    async fn reclaim(
        &self,
        key: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<StreamId>, AppError> {
        let mut con = self.con.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(key)
            .arg(CONSUMER_GROUP)
            .arg(consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut con)
            .await
            .map_err(unavailable)?;

        // Reply: [next-cursor, [[id, [field, value, ...]], ...], (deleted ids on Redis 7+)]
        match reply {
            Value::Array(parts) if parts.len() >= 2 => {
                let range = StreamRangeReply::from_redis_value(&parts[1]).map_err(unavailable)?;
                Ok(range.ids)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Convert stream entries into deliveries, dropping entries that are not envelopes.
    async fn into_deliveries(
        &self,
        queue: &str,
        key: &str,
        ids: Vec<StreamId>,
        redelivered: bool,
    ) -> Result<Vec<Delivery>, AppError> {
        let mut deliveries = Vec::with_capacity(ids.len());
        for entry in ids {
            match Envelope::from_fields(|field| entry.get::<String>(field)) {
                Ok(envelope) => deliveries.push(Delivery {
                    queue: queue.to_string(),
                    tag: entry.id,
                    redelivered,
                    envelope,
                }),
                Err(e) => {
                    tracing::error!(
                        queue,
                        entry_id = %entry.id,
                        error = %e,
                        "Discarding malformed stream entry"
                    );
                    self.remove(key, &entry.id).await?;
                }
            }
        }
        Ok(deliveries)
    }

    async fn remove(&self, key: &str, id: &str) -> Result<(), AppError> {
        let mut con = self.con.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(key)
            .arg(CONSUMER_GROUP)
            .arg(id)
            .ignore()
            .cmd("XDEL")
            .arg(key)
            .arg(id)
            .ignore()
            .query_async(&mut con)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), AppError> {
        let mut con = self.con.clone();
        let key = Self::stream_key(&queue.name);

        // Start the group at 0 so messages published before the first worker are not skipped.
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&key)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut con)
            .await;

        match created {
            Ok(()) => {
                tracing::debug!(queue = %queue.name, "Declared queue");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn append(&self, queue: &str, envelope: &Envelope) -> Result<(), AppError> {
        let mut con = self.con.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(Self::stream_key(queue)).arg("*");
        for (field, value) in envelope.fields()? {
            cmd.arg(field).arg(value);
        }

        let _: String = cmd.query_async(&mut con).await.map_err(unavailable)?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, AppError> {
        let key = Self::stream_key(queue);

        let claimed = self.reclaim(&key, consumer, max).await?;
        if !claimed.is_empty() {
            tracing::info!(queue, count = claimed.len(), "Reclaimed unacknowledged messages");
            return self.into_deliveries(queue, &key, claimed, true).await;
        }

        let mut con = self.con.clone();
        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(max)
            .block(block_millis(wait));

        let reply: Option<StreamReadReply> = con
            .xread_options(&[&key], &[">"], &opts)
            .await
            .map_err(unavailable)?;

        let ids = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();

        self.into_deliveries(queue, &key, ids, false).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.remove(&Self::stream_key(&delivery.queue), &delivery.tag)
            .await
    }

    async fn transfer(
        &self,
        delivery: &Delivery,
        targets: &[&str],
        envelope: &Envelope,
    ) -> Result<(), AppError> {
        let fields = envelope.fields()?;
        let source = Self::stream_key(&delivery.queue);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for target in targets {
            pipe.cmd("XADD").arg(Self::stream_key(target)).arg("*");
            for (field, value) in &fields {
                pipe.arg(*field).arg(value);
            }
            pipe.ignore();
        }
        pipe.cmd("XACK")
            .arg(&source)
            .arg(CONSUMER_GROUP)
            .arg(&delivery.tag)
            .ignore();
        pipe.cmd("XDEL").arg(&source).arg(&delivery.tag).ignore();

        let mut con = self.con.clone();
        let _: () = pipe.query_async(&mut con).await.map_err(unavailable)?;
        Ok(())
    }
}
