use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("session {key} is already held by {holder}")]
    Held { key: String, holder: String },
    #[error("lease backend failure: {0}")]
    Backend(String),
}

/// Exclusive ownership of one session key.
///
/// Implementations may be process-local or backed by a shared lease service;
/// the guard releases ownership when dropped.
pub trait SessionLease: Send + Sync {
    fn acquire(&self, key: &str, holder: &str) -> Result<LeaseGuard, LeaseError>;
}

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// Held lease; dropping it releases the key.
pub struct LeaseGuard {
    key: String,
    holder: String,
    release: Option<ReleaseFn>,
}

impl LeaseGuard {
    pub fn new(
        key: impl Into<String>,
        holder: impl Into<String>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            holder: holder.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!(key = %self.key, holder = %self.holder, "session lease released");
        }
    }
}

/// Lease table shared by every runtime in this process.
#[derive(Clone, Default)]
pub struct InProcessLease {
    held: Arc<Mutex<HashMap<String, String>>>,
}

impl InProcessLease {
    pub fn holder_of(&self, key: &str) -> Option<String> {
        self.held.lock().ok()?.get(key).cloned()
    }
}

impl SessionLease for InProcessLease {
    fn acquire(&self, key: &str, holder: &str) -> Result<LeaseGuard, LeaseError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LeaseError::Backend("lease table poisoned".to_owned()))?;
        if let Some(current) = held.get(key)
            && current != holder
        {
            return Err(LeaseError::Held {
                key: key.to_owned(),
                holder: current.clone(),
            });
        }
        held.insert(key.to_owned(), holder.to_owned());
        debug!(key, holder, "session lease acquired");

        let table = Arc::clone(&self.held);
        let owned_key = key.to_owned();
        let owned_holder = holder.to_owned();
        Ok(LeaseGuard::new(key, holder, move || {
            if let Ok(mut held) = table.lock()
                && held.get(&owned_key) == Some(&owned_holder)
            {
                held.remove(&owned_key);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_rejected_until_release() {
        let lease = InProcessLease::default();
        let guard = lease.acquire("session.json", "runtime-a").expect("first");

        let err = lease
            .acquire("session.json", "runtime-b")
            .expect_err("already held");
        assert_eq!(
            err,
            LeaseError::Held {
                key: "session.json".into(),
                holder: "runtime-a".into(),
            }
        );

        drop(guard);
        assert_eq!(lease.holder_of("session.json"), None);
        lease
            .acquire("session.json", "runtime-b")
            .expect("free after release");
    }

    #[test]
    fn keys_are_independent() {
        let lease = InProcessLease::default();
        let _a = lease.acquire("a.json", "runtime-a").expect("a");
        let _b = lease.acquire("b.json", "runtime-b").expect("b");
        assert_eq!(lease.holder_of("a.json").as_deref(), Some("runtime-a"));
        assert_eq!(lease.holder_of("b.json").as_deref(), Some("runtime-b"));
    }
}
