//! Primitive operations the survey store needs from a shared key-value
//! service. Mirrors the hash / sorted-set / WATCH-MULTI-EXEC subset of Redis.

use std::collections::HashMap;

use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("key-value serialization error: {0}")]
    Serialization(String),
    #[error("key-value operation failed: {0}")]
    Operation(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashScanPage {
    /// Zero once the scan has visited every field.
    pub cursor: u64,
    pub entries: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum KvCommand {
    Set {
        key: String,
        value: String,
    },
    Del {
        keys: Vec<String>,
    },
    HSet {
        key: String,
        entries: Vec<(String, String)>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    ZIncrBy {
        key: String,
        member: String,
        delta: f64,
    },
}

/// Commands buffered between MULTI and EXEC.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KvBatch {
    commands: Vec<KvCommand>,
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.commands.push(KvCommand::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn del(&mut self, keys: Vec<String>) -> &mut Self {
        if !keys.is_empty() {
            self.commands.push(KvCommand::Del { keys });
        }
        self
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.commands.push(KvCommand::HSet {
            key: key.into(),
            entries: vec![(field.into(), value.into())],
        });
        self
    }

    pub fn hdel(&mut self, key: impl Into<String>, fields: Vec<String>) -> &mut Self {
        if !fields.is_empty() {
            self.commands.push(KvCommand::HDel {
                key: key.into(),
                fields,
            });
        }
        self
    }

    pub fn zincrby(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        delta: f64,
    ) -> &mut Self {
        self.commands.push(KvCommand::ZIncrBy {
            key: key.into(),
            member: member.into(),
            delta,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[KvCommand] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<KvCommand> {
        self.commands
    }
}

/// A watched connection. Reads go through the watched connection; `exec`
/// commits the batch only if no watched key changed since `watch`, and
/// reports `false` otherwise.
pub trait KvTransaction: Send {
    fn get(&mut self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>>;

    fn hget(&mut self, key: &str, field: &str) -> BoxFuture<'_, Result<Option<String>, KvError>>;

    fn hgetall(&mut self, key: &str) -> BoxFuture<'_, Result<HashMap<String, String>, KvError>>;

    fn exec(self: Box<Self>, batch: KvBatch) -> BoxFuture<'static, Result<bool, KvError>>;

    fn discard(self: Box<Self>) -> BoxFuture<'static, Result<(), KvError>>;
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>>;

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), KvError>>;

    /// Returns how many of `keys` existed.
    fn del(&self, keys: &[String]) -> BoxFuture<'_, Result<u64, KvError>>;

    fn exists(&self, key: &str) -> BoxFuture<'_, Result<bool, KvError>>;

    fn hget(&self, key: &str, field: &str) -> BoxFuture<'_, Result<Option<String>, KvError>>;

    /// Returns how many fields were newly created.
    fn hset(&self, key: &str, entries: &[(String, String)]) -> BoxFuture<'_, Result<u64, KvError>>;

    fn hdel(&self, key: &str, fields: &[String]) -> BoxFuture<'_, Result<u64, KvError>>;

    fn hlen(&self, key: &str) -> BoxFuture<'_, Result<u64, KvError>>;

    fn hgetall(&self, key: &str) -> BoxFuture<'_, Result<HashMap<String, String>, KvError>>;

    fn hkeys(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, KvError>>;

    fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: Option<&str>,
        count: usize,
    ) -> BoxFuture<'_, Result<HashScanPage, KvError>>;

    fn zincrby(&self, key: &str, member: &str, delta: f64) -> BoxFuture<'_, Result<f64, KvError>>;

    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> BoxFuture<'_, Result<Vec<(String, f64)>, KvError>>;

    fn watch(&self, keys: &[String]) -> BoxFuture<'_, Result<Box<dyn KvTransaction>, KvError>>;
}
