use std::collections::HashMap;

use quorum_domain::ports::BoxFuture;
use quorum_domain::ports::kv::{
    HashScanPage, KeyValueStore, KvBatch, KvCommand, KvError, KvTransaction,
};
use redis::aio::{ConnectionManager, MultiplexedConnection};

fn map_err(err: redis::RedisError) -> KvError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        KvError::Unavailable(err.to_string())
    } else {
        KvError::Operation(err.to_string())
    }
}

/// MULTI/EXEC pipeline applying `batch` in order.
fn batch_pipeline(batch: KvBatch) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for command in batch.into_commands() {
        match command {
            KvCommand::Set { key, value } => {
                pipe.cmd("SET").arg(key).arg(value).ignore();
            }
            KvCommand::Del { keys } => {
                pipe.cmd("DEL").arg(keys).ignore();
            }
            KvCommand::HSet { key, entries } => {
                pipe.cmd("HSET").arg(key).arg(entries).ignore();
            }
            KvCommand::HDel { key, fields } => {
                pipe.cmd("HDEL").arg(key).arg(fields).ignore();
            }
            KvCommand::ZIncrBy { key, member, delta } => {
                pipe.cmd("ZINCRBY").arg(key).arg(delta).arg(member).ignore();
            }
        }
    }
    pipe
}

#[derive(Clone)]
pub struct RedisKvStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(redis_url: &str) -> Result<Self, KvError> {
        let client =
            redis::Client::open(redis_url).map_err(|err| KvError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| KvError::Unavailable(err.to_string()))?;
        Ok(Self { client, manager })
    }
}

impl KeyValueStore for RedisKvStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<String> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(value)
        })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), KvError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(())
        })
    }

    fn del(&self, keys: &[String]) -> BoxFuture<'_, Result<u64, KvError>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(0);
            }
            let mut conn = self.manager.clone();
            let removed: u64 = redis::cmd("DEL")
                .arg(keys)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(removed)
        })
    }

    fn exists(&self, key: &str) -> BoxFuture<'_, Result<bool, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let count: u64 = redis::cmd("EXISTS")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(count > 0)
        })
    }

    fn hget(&self, key: &str, field: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        let field = field.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<String> = redis::cmd("HGET")
                .arg(key)
                .arg(field)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(value)
        })
    }

    fn hset(&self, key: &str, entries: &[(String, String)]) -> BoxFuture<'_, Result<u64, KvError>> {
        let key = key.to_string();
        let entries = entries.to_vec();
        Box::pin(async move {
            if entries.is_empty() {
                return Ok(0);
            }
            let mut conn = self.manager.clone();
            let created: u64 = redis::cmd("HSET")
                .arg(key)
                .arg(entries)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(created)
        })
    }

    fn hdel(&self, key: &str, fields: &[String]) -> BoxFuture<'_, Result<u64, KvError>> {
        let key = key.to_string();
        let fields = fields.to_vec();
        Box::pin(async move {
            if fields.is_empty() {
                return Ok(0);
            }
            let mut conn = self.manager.clone();
            let removed: u64 = redis::cmd("HDEL")
                .arg(key)
                .arg(fields)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(removed)
        })
    }

    fn hlen(&self, key: &str) -> BoxFuture<'_, Result<u64, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let len: u64 = redis::cmd("HLEN")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(len)
        })
    }

    fn hgetall(&self, key: &str) -> BoxFuture<'_, Result<HashMap<String, String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let entries: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(entries)
        })
    }

    fn hkeys(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let fields: Vec<String> = redis::cmd("HKEYS")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(fields)
        })
    }

    fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: Option<&str>,
        count: usize,
    ) -> BoxFuture<'_, Result<HashScanPage, KvError>> {
        let key = key.to_string();
        let pattern = pattern.map(str::to_string);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut cmd = redis::cmd("HSCAN");
            cmd.arg(key).arg(cursor);
            if let Some(pattern) = pattern {
                cmd.arg("MATCH").arg(pattern);
            }
            cmd.arg("COUNT").arg(count.max(1));
            let (cursor, entries): (u64, Vec<(String, String)>) =
                cmd.query_async(&mut conn).await.map_err(map_err)?;
            Ok(HashScanPage { cursor, entries })
        })
    }

    fn zincrby(&self, key: &str, member: &str, delta: f64) -> BoxFuture<'_, Result<f64, KvError>> {
        let key = key.to_string();
        let member = member.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let score: f64 = redis::cmd("ZINCRBY")
                .arg(key)
                .arg(delta)
                .arg(member)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(score)
        })
    }

    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> BoxFuture<'_, Result<Vec<(String, f64)>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let members: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(score_bound(min))
                .arg(score_bound(max))
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(members)
        })
    }

    fn watch(&self, keys: &[String]) -> BoxFuture<'_, Result<Box<dyn KvTransaction>, KvError>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            // WATCH state lives on the connection, so every transaction gets
            // its own instead of sharing the manager.
            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(map_err)?;
            if !keys.is_empty() {
                let _: () = redis::cmd("WATCH")
                    .arg(keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_err)?;
            }
            Ok(Box::new(RedisTransaction { conn }) as Box<dyn KvTransaction>)
        })
    }
}

fn score_bound(value: f64) -> String {
    if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if value == f64::INFINITY {
        "+inf".to_string()
    } else {
        value.to_string()
    }
}

struct RedisTransaction {
    conn: MultiplexedConnection,
}

impl KvTransaction for RedisTransaction {
    fn get(&mut self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let value: Option<String> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut self.conn)
                .await
                .map_err(map_err)?;
            Ok(value)
        })
    }

    fn hget(&mut self, key: &str, field: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        let field = field.to_string();
        Box::pin(async move {
            let value: Option<String> = redis::cmd("HGET")
                .arg(key)
                .arg(field)
                .query_async(&mut self.conn)
                .await
                .map_err(map_err)?;
            Ok(value)
        })
    }

    fn hgetall(&mut self, key: &str) -> BoxFuture<'_, Result<HashMap<String, String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let entries: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(key)
                .query_async(&mut self.conn)
                .await
                .map_err(map_err)?;
            Ok(entries)
        })
    }

    fn exec(self: Box<Self>, batch: KvBatch) -> BoxFuture<'static, Result<bool, KvError>> {
        Box::pin(async move {
            let mut conn = self.conn;
            if batch.is_empty() {
                let _: () = redis::cmd("UNWATCH")
                    .query_async(&mut conn)
                    .await
                    .map_err(map_err)?;
                return Ok(true);
            }
            // EXEC replies nil when a watched key changed.
            let committed: Option<()> = batch_pipeline(batch)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(committed.is_some())
        })
    }

    fn discard(self: Box<Self>) -> BoxFuture<'static, Result<(), KvError>> {
        Box::pin(async move {
            let mut conn = self.conn;
            let _: () = redis::cmd("UNWATCH")
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(())
        })
    }
}
