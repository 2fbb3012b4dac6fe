//! Liveness-checked singleton lock for the scheduler.
//!
//! The TTL alone is not trusted: a holder that crashed leaves its entry
//! behind for up to an hour, so a claimant checks whether the recorded
//! holder is still alive and takes over when it is not.

use super::{DistributedMutex, LockToken};
use crate::error::Result;

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Who holds the singleton lock. Stored as JSON in the lock value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderIdentity {
    pub host: String,
    pub pid: u32,
    /// Distinguishes several claimants inside one process.
    pub token: String,
}

impl HolderIdentity {
    /// Identity of a new claimant in the current process.
    pub fn current() -> Self {
        Self {
            host: local_host(),
            pid: std::process::id(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

fn local_host() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Decides whether a recorded lock holder is still running.
pub trait Liveness: Send + Sync {
    fn is_alive(&self, holder: &HolderIdentity) -> bool;
}

/// Checks holders on this host by PID. A holder in this process is alive
/// while its [`SingletonLock`] exists. Holders on other hosts cannot be
/// inspected and are trusted until their TTL runs out.
#[derive(Debug, Clone)]
pub struct ProcessLiveness {
    host: String,
}

impl ProcessLiveness {
    pub fn new() -> Self {
        Self { host: local_host() }
    }
}

impl Default for ProcessLiveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness for ProcessLiveness {
    fn is_alive(&self, holder: &HolderIdentity) -> bool {
        if holder.host != self.host {
            return true;
        }
        if holder.pid == std::process::id() {
            return LIVE_CLAIMANTS.lock().contains(&holder.token);
        }
        pid_alive(holder.pid)
    }
}

/// Tokens of the [`SingletonLock`]s that exist in this process.
static LIVE_CLAIMANTS: Mutex<Vec<String>> = parking_lot::const_mutex(Vec::new());

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks that the process exists and may be signalled.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Result of a singleton claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// This instance holds the lock.
    Acquired,
    /// Another live instance holds it.
    HeldBy(HolderIdentity),
    /// The lock changed hands while claiming; try again later.
    Contended,
}

/// Coordinator ensuring one live scheduler across processes.
///
/// Construct one per process entrypoint and hand it to the scheduler.
pub struct SingletonLock {
    mutex: DistributedMutex,
    key: String,
    ttl: Duration,
    identity: HolderIdentity,
    liveness: Arc<dyn Liveness>,
    token: Mutex<Option<LockToken>>,
}

impl SingletonLock {
    pub const DEFAULT_KEY: &'static str = "scheduler:singleton";

    pub fn new(mutex: DistributedMutex, ttl: Duration, liveness: Arc<dyn Liveness>) -> Self {
        let identity = HolderIdentity::current();
        LIVE_CLAIMANTS.lock().push(identity.token.clone());
        Self {
            mutex,
            key: Self::DEFAULT_KEY.to_string(),
            ttl,
            identity,
            liveness,
            token: Mutex::new(None),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn identity(&self) -> &HolderIdentity {
        &self.identity
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this instance believes it holds the lock.
    pub fn is_claimed(&self) -> bool {
        self.token.lock().is_some()
    }

    /// Take or keep the lock.
    ///
    /// A held lock is renewed. A lock held by a dead process is cleared and
    /// taken over. A lock held by a live process is left alone.
    pub fn claim(&self) -> Result<Claim> {
        let held = self.token.lock().clone();
        if let Some(token) = held {
            if self.mutex.renew(&self.key, &token, self.ttl)? {
                return Ok(Claim::Acquired);
            }
            warn!("Singleton lock {} was lost, claiming again", self.key);
            *self.token.lock() = None;
        }

        let value = serde_json::to_string(&self.identity)?;
        for _ in 0..2 {
            if let Some(token) = self.mutex.acquire_as(&self.key, &value, self.ttl)? {
                info!("Singleton lock {} acquired by pid {}", self.key, self.identity.pid);
                *self.token.lock() = Some(token);
                return Ok(Claim::Acquired);
            }

            let Some(raw) = self.mutex.holder(&self.key)? else {
                // Expired between the two calls.
                continue;
            };
            match serde_json::from_str::<HolderIdentity>(&raw) {
                Ok(holder) if self.liveness.is_alive(&holder) => {
                    return Ok(Claim::HeldBy(holder));
                }
                Ok(holder) => warn!(
                    "Stale singleton lock {} held by dead pid {} on {}, clearing",
                    self.key, holder.pid, holder.host
                ),
                Err(_) => warn!("Unreadable singleton lock {} value {:?}, clearing", self.key, raw),
            }
            self.mutex.clear_holder(&self.key, &raw)?;
        }

        match self.mutex.holder(&self.key)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(holder) => Ok(Claim::HeldBy(holder)),
                Err(_) => Ok(Claim::Contended),
            },
            None => Ok(Claim::Contended),
        }
    }

    /// Release the lock if this instance holds it.
    pub fn release(&self) -> Result<bool> {
        let Some(token) = self.token.lock().take() else {
            return Ok(false);
        };
        let released = self.mutex.release(&self.key, &token)?;
        if released {
            info!("Singleton lock {} released", self.key);
        }
        Ok(released)
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        LIVE_CLAIMANTS.lock().retain(|token| *token != self.identity.token);
        if let Some(token) = self.token.get_mut().take() {
            match self.mutex.release(&self.key, &token) {
                Ok(true) => info!("Singleton lock {} released on drop", self.key),
                Ok(false) => {}
                Err(e) => warn!("Failed to release singleton lock {} on drop: {}", self.key, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStore, MemoryKv};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedLiveness(AtomicBool);

    impl Liveness for FixedLiveness {
        fn is_alive(&self, _holder: &HolderIdentity) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn lock(kv: &Arc<MemoryKv>, liveness: Arc<dyn Liveness>) -> SingletonLock {
        let kv: Arc<dyn KvStore> = kv.clone();
        SingletonLock::new(DistributedMutex::new(kv), Duration::from_secs(3600), liveness)
    }

    #[test]
    fn second_live_instance_is_refused() {
        let kv = Arc::new(MemoryKv::new());
        let first = lock(&kv, Arc::new(ProcessLiveness::new()));
        let second = lock(&kv, Arc::new(ProcessLiveness::new()));

        assert_eq!(first.claim().unwrap(), Claim::Acquired);
        match second.claim().unwrap() {
            Claim::HeldBy(holder) => assert_eq!(&holder, first.identity()),
            other => panic!("unexpected claim {other:?}"),
        }
        assert_eq!(first.claim().unwrap(), Claim::Acquired);
    }

    #[test]
    fn dead_holder_is_taken_over() {
        let kv = Arc::new(MemoryKv::new());
        let alive = Arc::new(FixedLiveness(AtomicBool::new(true)));
        let crashed = lock(&kv, alive.clone());
        let successor = lock(&kv, alive.clone());

        assert_eq!(crashed.claim().unwrap(), Claim::Acquired);
        assert!(matches!(successor.claim().unwrap(), Claim::HeldBy(_)));

        alive.0.store(false, Ordering::SeqCst);
        assert_eq!(successor.claim().unwrap(), Claim::Acquired);
        assert!(!crashed.release().unwrap());
        assert!(successor.release().unwrap());
        assert_eq!(kv.get(SingletonLock::DEFAULT_KEY).unwrap(), None);
    }

    #[test]
    fn dropped_holder_in_this_process_is_not_alive() {
        let kv = Arc::new(MemoryKv::new());
        let liveness = ProcessLiveness::new();
        let first = lock(&kv, Arc::new(ProcessLiveness::new()));
        let identity = first.identity().clone();
        assert!(liveness.is_alive(&identity));

        assert_eq!(first.claim().unwrap(), Claim::Acquired);
        drop(first);
        assert!(!liveness.is_alive(&identity));
        assert_eq!(kv.get(SingletonLock::DEFAULT_KEY).unwrap(), None);
    }

    #[test]
    fn garbage_lock_value_is_cleared() {
        let kv = Arc::new(MemoryKv::new());
        kv.set_nx_ex(SingletonLock::DEFAULT_KEY, "12345", Duration::from_secs(60))
            .unwrap();
        let lock = lock(&kv, Arc::new(ProcessLiveness::new()));
        assert_eq!(lock.claim().unwrap(), Claim::Acquired);
    }

    #[cfg(unix)]
    #[test]
    fn exited_process_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let liveness = ProcessLiveness::new();
        let ghost = HolderIdentity {
            host: local_host(),
            pid,
            token: "t".into(),
        };
        assert!(!liveness.is_alive(&ghost));

        let elsewhere = HolderIdentity {
            host: "another-host.invalid".into(),
            ..ghost
        };
        assert!(liveness.is_alive(&elsewhere));
    }
}
