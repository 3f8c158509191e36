use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::ports::BoxFuture;
use crate::ports::kv::{
    HashScanPage, KeyValueStore, KvBatch, KvCommand, KvError, KvTransaction,
};

const WRONG_TYPE: &str = "WRONGTYPE operation against a key holding the wrong kind of value";

#[derive(Clone, Debug)]
enum Entry {
    Str(String),
    Hash(BTreeMap<String, String>),
    ZSet(BTreeMap<String, f64>),
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
    /// Bumped on every write, including deletes; never removed so that a
    /// delete-then-recreate is still visible to watchers.
    versions: HashMap<String, u64>,
    clock: u64,
}

impl MemoryState {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn string(&self, key: &str) -> Result<Option<String>, KvError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(KvError::Operation(WRONG_TYPE.into())),
        }
    }

    fn hash(&self, key: &str) -> Result<Option<&BTreeMap<String, String>>, KvError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::Hash(fields)) => Ok(Some(fields)),
            Some(_) => Err(KvError::Operation(WRONG_TYPE.into())),
        }
    }

    fn hash_entries(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        Ok(self
            .hash(key)?
            .map(|fields| fields.clone().into_iter().collect())
            .unwrap_or_default())
    }

    fn set(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_string(), Entry::Str(value));
        self.touch(key);
    }

    fn del(&mut self, keys: &[String]) -> u64 {
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                removed += 1;
                self.touch(key);
            }
        }
        removed
    }

    fn hset(&mut self, key: &str, entries: &[(String, String)]) -> Result<u64, KvError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(BTreeMap::new()));
        let Entry::Hash(fields) = slot else {
            return Err(KvError::Operation(WRONG_TYPE.into()));
        };
        let mut created = 0;
        for (field, value) in entries {
            if fields.insert(field.clone(), value.clone()).is_none() {
                created += 1;
            }
        }
        self.touch(key);
        Ok(created)
    }

    fn hdel(&mut self, key: &str, fields: &[String]) -> Result<u64, KvError> {
        let Some(slot) = self.entries.get_mut(key) else {
            return Ok(0);
        };
        let Entry::Hash(existing) = slot else {
            return Err(KvError::Operation(WRONG_TYPE.into()));
        };
        let mut removed = 0;
        for field in fields {
            if existing.remove(field).is_some() {
                removed += 1;
            }
        }
        let now_empty = existing.is_empty();
        if now_empty {
            self.entries.remove(key);
        }
        if removed > 0 {
            self.touch(key);
        }
        Ok(removed)
    }

    fn zincrby(&mut self, key: &str, member: &str, delta: f64) -> Result<f64, KvError> {
        let slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::ZSet(BTreeMap::new()));
        let Entry::ZSet(members) = slot else {
            return Err(KvError::Operation(WRONG_TYPE.into()));
        };
        let score = members.entry(member.to_string()).or_insert(0.0);
        *score += delta;
        let score = *score;
        self.touch(key);
        Ok(score)
    }

    fn apply(&mut self, command: KvCommand) -> Result<(), KvError> {
        match command {
            KvCommand::Set { key, value } => self.set(&key, value),
            KvCommand::Del { keys } => {
                self.del(&keys);
            }
            KvCommand::HSet { key, entries } => {
                self.hset(&key, &entries)?;
            }
            KvCommand::HDel { key, fields } => {
                self.hdel(&key, &fields)?;
            }
            KvCommand::ZIncrBy { key, member, delta } => {
                self.zincrby(&key, &member, delta)?;
            }
        }
        Ok(())
    }
}

/// Process-local key-value store with the same watch/commit semantics as the
/// Redis adapter. Backs tests and the `memory` data backend.
#[derive(Clone, Debug, Default)]
pub struct InMemoryKvStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently holding a value.
    pub fn key_count(&self) -> usize {
        let guard = self.inner.lock().expect("kv store lock");
        guard.entries.len()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let guard = self.inner.lock().expect("kv store lock");
        let mut keys: Vec<String> = guard
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

fn glob_match(pattern: &[u8], value: &[u8]) -> bool {
    match (pattern.first(), value.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], value)
                || (!value.is_empty() && glob_match(pattern, &value[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &value[1..]),
        (Some(expected), Some(actual)) if expected == actual => {
            glob_match(&pattern[1..], &value[1..])
        }
        _ => false,
    }
}

impl KeyValueStore for InMemoryKvStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let guard = self.inner.lock().expect("kv store lock");
            guard.string(&key)
        })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), KvError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("kv store lock");
            guard.set(&key, value);
            Ok(())
        })
    }

    fn del(&self, keys: &[String]) -> BoxFuture<'_, Result<u64, KvError>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("kv store lock");
            Ok(guard.del(&keys))
        })
    }

    fn exists(&self, key: &str) -> BoxFuture<'_, Result<bool, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let guard = self.inner.lock().expect("kv store lock");
            Ok(guard.entries.contains_key(&key))
        })
    }

    fn hget(&self, key: &str, field: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        let field = field.to_string();
        Box::pin(async move {
            let guard = self.inner.lock().expect("kv store lock");
            Ok(guard
                .hash(&key)?
                .and_then(|fields| fields.get(&field).cloned()))
        })
    }

    fn hset(&self, key: &str, entries: &[(String, String)]) -> BoxFuture<'_, Result<u64, KvError>> {
        let key = key.to_string();
        let entries = entries.to_vec();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("kv store lock");
            guard.hset(&key, &entries)
        })
    }

    fn hdel(&self, key: &str, fields: &[String]) -> BoxFuture<'_, Result<u64, KvError>> {
        let key = key.to_string();
        let fields = fields.to_vec();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("kv store lock");
            guard.hdel(&key, &fields)
        })
    }

    fn hlen(&self, key: &str) -> BoxFuture<'_, Result<u64, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let guard = self.inner.lock().expect("kv store lock");
            Ok(guard
                .hash(&key)?
                .map(|fields| fields.len() as u64)
                .unwrap_or(0))
        })
    }

    fn hgetall(&self, key: &str) -> BoxFuture<'_, Result<HashMap<String, String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let guard = self.inner.lock().expect("kv store lock");
            guard.hash_entries(&key)
        })
    }

    fn hkeys(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let guard = self.inner.lock().expect("kv store lock");
            Ok(guard
                .hash(&key)?
                .map(|fields| fields.keys().cloned().collect())
                .unwrap_or_default())
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
        let count = count.max(1);
        Box::pin(async move {
            let guard = self.inner.lock().expect("kv store lock");
            let Some(fields) = guard.hash(&key)? else {
                return Ok(HashScanPage::default());
            };
            // The cursor is an offset into the ordered fields.
            let start = cursor as usize;
            let end = start.saturating_add(count).min(fields.len());
            let entries = fields
                .iter()
                .skip(start)
                .take(end.saturating_sub(start))
                .filter(|(field, _)| match &pattern {
                    Some(pattern) => glob_match(pattern.as_bytes(), field.as_bytes()),
                    None => true,
                })
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect();
            let cursor = if end >= fields.len() { 0 } else { end as u64 };
            Ok(HashScanPage { cursor, entries })
        })
    }

    fn zincrby(&self, key: &str, member: &str, delta: f64) -> BoxFuture<'_, Result<f64, KvError>> {
        let key = key.to_string();
        let member = member.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("kv store lock");
            guard.zincrby(&key, &member, delta)
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
            let guard = self.inner.lock().expect("kv store lock");
            let members = match guard.entries.get(&key) {
                None => return Ok(Vec::new()),
                Some(Entry::ZSet(members)) => members,
                Some(_) => return Err(KvError::Operation(WRONG_TYPE.into())),
            };
            let mut ranged: Vec<(String, f64)> = members
                .iter()
                .filter(|(_, score)| **score >= min && **score <= max)
                .map(|(member, score)| (member.clone(), *score))
                .collect();
            ranged.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            Ok(ranged)
        })
    }

    fn watch(&self, keys: &[String]) -> BoxFuture<'_, Result<Box<dyn KvTransaction>, KvError>> {
        let keys = keys.to_vec();
        let inner = self.inner.clone();
        Box::pin(async move {
            let watched = {
                let guard = inner.lock().expect("kv store lock");
                keys.into_iter()
                    .map(|key| {
                        let version = guard.version(&key);
                        (key, version)
                    })
                    .collect()
            };
            Ok(Box::new(MemoryTransaction { inner, watched }) as Box<dyn KvTransaction>)
        })
    }
}

struct MemoryTransaction {
    inner: Arc<Mutex<MemoryState>>,
    watched: Vec<(String, u64)>,
}

impl KvTransaction for MemoryTransaction {
    fn get(&mut self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let guard = self.inner.lock().expect("kv store lock");
            guard.string(&key)
        })
    }

    fn hget(&mut self, key: &str, field: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        let field = field.to_string();
        Box::pin(async move {
            let guard = self.inner.lock().expect("kv store lock");
            Ok(guard
                .hash(&key)?
                .and_then(|fields| fields.get(&field).cloned()))
        })
    }

    fn hgetall(&mut self, key: &str) -> BoxFuture<'_, Result<HashMap<String, String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let guard = self.inner.lock().expect("kv store lock");
            guard.hash_entries(&key)
        })
    }

    fn exec(self: Box<Self>, batch: KvBatch) -> BoxFuture<'static, Result<bool, KvError>> {
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("kv store lock");
            let unchanged = self
                .watched
                .iter()
                .all(|(key, version)| guard.version(key) == *version);
            if !unchanged {
                return Ok(false);
            }
            for command in batch.into_commands() {
                guard.apply(command)?;
            }
            Ok(true)
        })
    }

    fn discard(self: Box<Self>) -> BoxFuture<'static, Result<(), KvError>> {
        Box::pin(async move { Ok(()) })
    }
}
