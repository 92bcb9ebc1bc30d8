use super::{CounterStore, Result, StoreError, StoreOp, QUEUE_MAX_LEN};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

/// How often the GC task sweeps keys whose TTL has passed.
const GC_INTERVAL_SECS: u64 = 30;

/// In-process store with the same TTL, sorted-set and list semantics as the
/// Redis backend. Counters are local to the process, so this is only suitable
/// for a single instance or tests.
///
/// Expiry is lazy on access plus a periodic sweep (`start_gc`), so keys that
/// are never touched again (one-shot nonces) still go away. Outbound queues
/// keep only the newest `QUEUE_MAX_LEN` payloads.
///
/// Expiry uses `tokio::time::Instant`, so a paused test clock drives it.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    queues: HashMap<String, VecDeque<String>>,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Codec(format!("WRONGTYPE operation against key {}", key))
}

impl Inner {
    /// Live entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= Instant::now()
        );
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// Drop every entry whose expiry has passed. Returns how many went.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        before - self.entries.len()
    }

    fn incr(&mut self, key: &str, delta: i64) -> Result<i64> {
        match self.live(key) {
            Some(entry) => match &mut entry.value {
                Value::Str(s) => {
                    let current: i64 = s.parse().map_err(|_| {
                        StoreError::Codec(format!("value is not an integer, key={}", key))
                    })?;
                    let next = current + delta;
                    *s = next.to_string();
                    Ok(next)
                }
                _ => Err(wrong_type(key)),
            },
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str(delta.to_string()),
                        expires_at: None,
                    },
                );
                Ok(delta)
            }
        }
    }

    fn expire(&mut self, key: &str, ttl_secs: u64) -> bool {
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                true
            }
            None => false,
        }
    }

    fn zset_mut(&mut self, key: &str) -> Result<&mut HashMap<String, f64>> {
        if self.live(key).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::ZSet(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                value: Value::ZSet(set),
                ..
            }) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }

    fn zincr(&mut self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let set = self.zset_mut(key)?;
        let score = set.entry(member.to_string()).or_insert(0.0);
        *score += delta;
        Ok(*score)
    }

    fn ztrim_top(&mut self, key: &str, keep: usize) -> Result<u64> {
        let Some(entry) = self.live(key) else {
            return Ok(0);
        };
        let Value::ZSet(set) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        if set.len() <= keep {
            return Ok(0);
        }
        let mut ranked = sorted_ascending(set);
        let overflow = ranked.len() - keep;
        ranked.truncate(overflow);
        for (member, _) in &ranked {
            set.remove(member);
        }
        let now_empty = set.is_empty();
        if now_empty {
            self.entries.remove(key);
        }
        Ok(overflow as u64)
    }
}

/// Members in rank order: score ascending, ties broken by member name.
fn sorted_ascending(set: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Redis-style inclusive range with negative indices counting from the end.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Payloads appended to `queue`, oldest first.
    pub fn queued(&self, queue: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of keys held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn purge_expired(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    /// Spawn the periodic expiry sweep. The task ends once the store is dropped.
    pub fn start_gc(self: &Arc<Self>) {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!("store: memory: gc purged {} expired keys", purged);
                }
            }
        });
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl_secs: u64) -> Result<i64> {
        let mut inner = self.lock();
        let count = inner.incr(key, delta)?;
        if count == delta {
            inner.expire(key, ttl_secs);
        }
        Ok(count)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut inner = self.lock();
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.lock();
        match inner.live(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut inner = self.lock();
        // MGET answers nil for keys holding another type.
        Ok(keys
            .iter()
            .map(|key| match inner.live(key) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Some(s.clone()),
                _ => None,
            })
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let expires_at = ttl_secs.map(|ttl| Instant::now() + Duration::from_secs(ttl));
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock();
        let existed = inner.live(key).is_some();
        inner.entries.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.lock().live(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let mut inner = self.lock();
        Ok(inner
            .live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()).as_secs()))
    }

    async fn zincr(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        self.lock().zincr(key, member, delta)
    }

    async fn ztrim_top(&self, key: &str, keep: usize) -> Result<u64> {
        self.lock().ztrim_top(key, keep)
    }

    async fn ztop(&self, key: &str, n: usize) -> Result<Vec<(String, f64)>> {
        let mut inner = self.lock();
        match inner.live(key) {
            Some(Entry {
                value: Value::ZSet(set),
                ..
            }) => {
                let mut ranked = sorted_ascending(set);
                ranked.reverse();
                ranked.truncate(n);
                Ok(ranked)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn list_push_trim(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let mut inner = self.lock();
        if inner.live(key).is_none() {
            inner.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match inner.entries.get_mut(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                list.push_front(value.to_string());
                list.truncate(cap);
                if list.is_empty() {
                    inner.entries.remove(key);
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut inner = self.lock();
        match inner.live(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn enqueue(&self, queue: &str, payload: &str) -> Result<()> {
        let mut inner = self.lock();
        let q = inner.queues.entry(queue.to_string()).or_default();
        q.push_back(payload.to_string());
        while q.len() as u64 > QUEUE_MAX_LEN {
            q.pop_front();
        }
        Ok(())
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut inner = self.lock();
        for op in ops {
            match op {
                StoreOp::Incr {
                    key,
                    delta,
                    ttl_secs,
                } => {
                    if inner.incr(&key, delta)? == delta {
                        inner.expire(&key, ttl_secs);
                    }
                }
                StoreOp::ZIncr { key, member, delta } => {
                    inner.zincr(&key, &member, delta)?;
                }
                StoreOp::ZTrimTop { key, keep } => {
                    inner.ztrim_top(&key, keep)?;
                }
                StoreOp::Expire { key, ttl_secs } => {
                    inner.expire(&key, ttl_secs);
                }
            }
        }
        Ok(())
    }
}
