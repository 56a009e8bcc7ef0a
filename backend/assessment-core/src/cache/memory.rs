use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};

use super::{CacheError, CacheStore};

/// In-process cache store with TTLs, glob SCAN and a switch to simulate an outage.
#[derive(Debug)]
pub struct MemoryCacheStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    available: AtomicBool,
    /// Open scan cursors, each pointing at the last key it examined.
    cursors: Mutex<HashMap<u64, String>>,
    next_cursor: AtomicU64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            cursors: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
        }
    }

    /// While unavailable every call fails with `CacheError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Live keys, for inspection in tests.
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("memory store switched off".to_string()))
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check()?;
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.check()?;
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let mut deleted = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if entry.expires_at > now {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        self.check()?;
        // Resuming after a key rather than a position keeps deletes between
        // steps from shifting unvisited keys past the cursor.
        let after = if cursor == 0 {
            None
        } else {
            match self.cursors.lock().await.remove(&cursor) {
                Some(last) => Some(last),
                None => return Ok((0, Vec::new())),
            }
        };

        let entries = self.entries.read().await;
        let step = count.max(1);
        let now = Instant::now();
        let lower = match &after {
            Some(last) => Bound::Excluded(last.as_str()),
            None => Bound::Unbounded,
        };

        // Like SCAN, COUNT bounds the keys examined, not the keys returned.
        let examined: Vec<(&String, &Entry)> = entries
            .range::<str, _>((lower, Bound::Unbounded))
            .take(step)
            .collect();
        let matched = examined
            .iter()
            .filter(|(k, e)| e.expires_at > now && glob_match(pattern, k))
            .map(|(k, _)| (*k).clone())
            .collect();

        let last = match examined.last() {
            Some((k, _)) if examined.len() == step => (*k).clone(),
            _ => return Ok((0, matched)),
        };
        let more = entries
            .range::<str, _>((Bound::Excluded(last.as_str()), Bound::Unbounded))
            .next()
            .is_some();
        if !more {
            return Ok((0, matched));
        }

        let next = self.next_cursor.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().await.insert(next, last);
        Ok((next, matched))
    }
}

/// Redis-style glob supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
