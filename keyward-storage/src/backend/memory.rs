//! Process-local backend.
//!
//! Mirrors the semantics the cache relies on from a remote store: lazy
//! expiration, atomic conditional set and compare-and-delete, resumable SCAN
//! and type-checked set operations. Clones share the same underlying map, so
//! several caches built on clones of one `InMemoryBackend` behave like
//! several processes talking to one server.
//!
//! # Thread Safety
//!
//! All state sits behind a single `std::sync::Mutex` that is never held
//! across an `.await`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keyward_core::{BackendError, BackendResult};

use super::{KeyTtl, KvBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    /// Creation order; SCAN cursors walk this sequence so deletions made
    /// between SCAN calls never cause keys to be skipped.
    seq: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, Entry>,
    /// Keys by creation sequence, for SCAN.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl Store {
    /// Live entry for `key`, evicting it first if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn insert(&mut self, key: &str, value: Value, expires_at: Option<Instant>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value;
            entry.expires_at = expires_at;
            return;
        }
        self.next_seq += 1;
        self.order.insert(self.next_seq, key.to_string());
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                seq: self.next_seq,
            },
        );
    }
}

/// In-memory [`KvBackend`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<Mutex<Store>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`BackendError::Unavailable`]
    /// until switched back, simulating a lost connection.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.live_keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live keys, sorted.
    pub fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = match self.store.lock() {
            Ok(store) => store
                .entries
                .iter()
                .filter(|(_, e)| !e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        keys.sort();
        keys
    }

    fn with_store<R>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut Store, Instant) -> BackendResult<R>,
    ) -> BackendResult<R> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable(operation, "connection refused"));
        }
        let mut store = self.store.lock().map_err(|_| BackendError::LockPoisoned)?;
        f(&mut *store, Instant::now())
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn set(
        &self,
        key: &str,
        value: String,
        expiration: Option<Duration>,
    ) -> BackendResult<()> {
        self.with_store("SET", |store, now| {
            store.insert(key, Value::Text(value), expiration.map(|d| now + d));
            Ok(())
        })
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        expiration: Duration,
    ) -> BackendResult<bool> {
        self.with_store("SET NX", |store, now| {
            if store.live(key, now).is_some() {
                return Ok(false);
            }
            store.insert(key, Value::Text(value), Some(now + expiration));
            Ok(true)
        })
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.with_store("GET", |store, now| match store.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(BackendError::WrongType {
                key: key.to_string(),
            }),
        })
    }

    async fn get_many(&self, keys: &[String]) -> BackendResult<Vec<Option<String>>> {
        self.with_store("MGET", |store, now| {
            Ok(keys
                .iter()
                .map(|key| match store.live(key, now) {
                    Some(Entry {
                        value: Value::Text(text),
                        ..
                    }) => Some(text.clone()),
                    // MGET reports non-string values as nil rather than failing.
                    _ => None,
                })
                .collect())
        })
    }

    async fn delete(&self, keys: &[String]) -> BackendResult<u64> {
        self.with_store("DEL", |store, now| {
            let mut removed = 0;
            for key in keys {
                if store.live(key, now).is_some() {
                    store.remove(key);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> BackendResult<bool> {
        self.with_store("DEL IF EQ", |store, now| {
            let matches = matches!(
                store.live(key, now),
                Some(Entry { value: Value::Text(text), .. }) if text.as_str() == expected
            );
            if matches {
                store.remove(key);
            }
            Ok(matches)
        })
    }

    async fn expire(&self, key: &str, expiration: Duration) -> BackendResult<bool> {
        self.with_store("PEXPIRE", |store, now| match store.live(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + expiration);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn ttl(&self, key: &str) -> BackendResult<KeyTtl> {
        self.with_store("PTTL", |store, now| {
            Ok(match store.live(key, now) {
                None => KeyTtl::Missing,
                Some(Entry {
                    expires_at: None, ..
                }) => KeyTtl::Persistent,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => KeyTtl::Expiring(at.saturating_duration_since(now)),
            })
        })
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        self.with_store("EXISTS", |store, now| Ok(store.live(key, now).is_some()))
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> BackendResult<(u64, Vec<String>)> {
        self.with_store("SCAN", |store, now| {
            let count = count.max(1);
            let mut batch = Vec::new();
            let mut expired = Vec::new();
            let mut next = 0;
            for (examined, (&seq, key)) in store.order.range(cursor..).enumerate() {
                if examined == count {
                    next = seq;
                    break;
                }
                match store.entries.get(key) {
                    Some(entry) if entry.is_expired(now) => expired.push(key.clone()),
                    Some(_) if glob_match(pattern, key) => batch.push(key.clone()),
                    _ => {}
                }
            }
            // Evict the expired keys this batch passed over.
            for key in &expired {
                store.remove(key);
            }
            Ok((next, batch))
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> BackendResult<()> {
        self.with_store("SADD", |store, now| match store.live(key, now) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => {
                members.insert(member.to_string());
                Ok(())
            }
            Some(_) => Err(BackendError::WrongType {
                key: key.to_string(),
            }),
            None => {
                let members = HashSet::from([member.to_string()]);
                store.insert(key, Value::Set(members), None);
                Ok(())
            }
        })
    }

    async fn set_contains(&self, key: &str, member: &str) -> BackendResult<bool> {
        self.with_store("SISMEMBER", |store, now| match store.live(key, now) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.contains(member)),
            Some(_) => Err(BackendError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(false),
        })
    }

    async fn set_members(&self, key: &str) -> BackendResult<HashSet<String>> {
        self.with_store("SMEMBERS", |store, now| match store.live(key, now) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.clone()),
            Some(_) => Err(BackendError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(HashSet::new()),
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> BackendResult<()> {
        self.with_store("SREM", |store, now| {
            let now_empty = match store.live(key, now) {
                Some(Entry {
                    value: Value::Set(members),
                    ..
                }) => {
                    members.remove(member);
                    members.is_empty()
                }
                Some(_) => {
                    return Err(BackendError::WrongType {
                        key: key.to_string(),
                    })
                }
                None => false,
            };
            // Like Redis, an emptied set stops existing.
            if now_empty {
                store.remove(key);
            }
            Ok(())
        })
    }
}

/// Glob matching with `*` (any run) and `?` (any single char).
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_ti = 0;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
