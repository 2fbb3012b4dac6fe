//! TTL-based mutual exclusion across processes.
//!
//! Acquisition never waits: a refusal comes back immediately as `None`,
//! which callers treat as "already in progress", not as an error.

mod singleton;

pub use singleton::{Claim, HolderIdentity, Liveness, ProcessLiveness, SingletonLock};

use crate::error::Result;
use crate::kv::KvStore;

use log::debug;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Proof of holding a lock. Only the matching token can release or renew it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lock primitive over a shared [`KvStore`].
#[derive(Clone)]
pub struct DistributedMutex {
    kv: Arc<dyn KvStore>,
}

impl DistributedMutex {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Try to take `key` for `ttl` with a fresh random token.
    pub fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        self.acquire_as(key, &Uuid::new_v4().to_string(), ttl)
    }

    /// Try to take `key` for `ttl`, recording `holder` as the lock value.
    pub fn acquire_as(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<LockToken>> {
        if self.kv.set_nx_ex(key, holder, ttl)? {
            debug!("Acquired lock {} for {:?}", key, ttl);
            Ok(Some(LockToken(holder.to_string())))
        } else {
            debug!("Lock {} is already held", key);
            Ok(None)
        }
    }

    /// Release `key` if `token` still holds it.
    pub fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        self.kv.delete_if_eq(key, &token.0)
    }

    /// Extend the TTL of `key` if `token` still holds it.
    pub fn renew(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool> {
        self.kv.expire_if_eq(key, &token.0, ttl)
    }

    pub fn is_held(&self, key: &str) -> Result<bool> {
        Ok(self.kv.get(key)?.is_some())
    }

    /// The value recorded by the current holder of `key`.
    pub fn holder(&self, key: &str) -> Result<Option<String>> {
        self.kv.get(key)
    }

    /// Remove `key` only if it still carries `holder`, e.g. a stale holder.
    pub fn clear_holder(&self, key: &str, holder: &str) -> Result<bool> {
        self.kv.delete_if_eq(key, holder)
    }

    /// Remove `key` regardless of who holds it.
    pub fn force_clear(&self, key: &str) -> Result<()> {
        self.kv.delete(key)
    }

    /// Currently held keys starting with `prefix`.
    pub fn held_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.kv.keys(prefix)
    }
}

/// Deterministic lock key for a job: name plus a hash of its parameters.
///
/// Object keys are sorted before hashing, so parameter order never matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    name: String,
    key: String,
}

impl JobKey {
    pub const PREFIX: &'static str = "job_lock:";

    pub fn new(name: &str, params: &Value) -> Self {
        let mut canonical = String::new();
        write_canonical(params, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        Self {
            name: name.to_string(),
            key: format!("{}{}:{:x}", Self::PREFIX, name, digest),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Job name encoded in a raw lock key, if it is a job key.
    pub fn name_of(raw: &str) -> Option<&str> {
        raw.strip_prefix(Self::PREFIX)?.rsplit_once(':').map(|(name, _)| name)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;

    fn mutex() -> DistributedMutex {
        DistributedMutex::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn job_key_ignores_parameter_order() {
        let a = JobKey::new("douban_spider", &json!({"movie": "X", "strategy": "sequential"}));
        let b = JobKey::new("douban_spider", &json!({"strategy": "sequential", "movie": "X"}));
        let c = JobKey::new("douban_spider", &json!({"movie": "Y", "strategy": "sequential"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("job_lock:douban_spider:"));
        assert_eq!(JobKey::name_of(a.as_str()), Some("douban_spider"));
        assert_eq!(JobKey::name_of("scheduler:singleton"), None);
    }

    #[test]
    fn only_one_holder_at_a_time() {
        let mutex = mutex();
        let token = mutex.acquire("k", Duration::from_secs(60)).unwrap().unwrap();
        assert!(mutex.acquire("k", Duration::from_secs(60)).unwrap().is_none());
        assert!(mutex.is_held("k").unwrap());

        let impostor = LockToken("not-the-holder".into());
        assert!(!mutex.release("k", &impostor).unwrap());
        assert!(mutex.release("k", &token).unwrap());
        assert!(!mutex.is_held("k").unwrap());
        assert!(mutex.acquire("k", Duration::from_secs(60)).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken_again() {
        let mutex = mutex();
        let first = mutex.acquire("k", Duration::from_secs(30)).unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(!mutex.is_held("k").unwrap());
        let second = mutex.acquire("k", Duration::from_secs(30)).unwrap().unwrap();
        assert_ne!(first, second);
        assert!(!mutex.release("k", &first).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_only_for_holder() {
        let mutex = mutex();
        let token = mutex.acquire("k", Duration::from_secs(30)).unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(mutex.renew("k", &token, Duration::from_secs(30)).unwrap());
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(mutex.is_held("k").unwrap());
        assert!(!mutex.renew("k", &LockToken("x".into()), Duration::from_secs(30)).unwrap());
    }
}
