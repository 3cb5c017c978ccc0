//! Per-owner creation lock.
//!
//! Session creation and any read-modify-write cycle on one conversation must
//! be serialized by a lock keyed on the conversation owner. Production
//! deployments supply a distributed implementation of [`SessionLock`];
//! [`LocalSessionLock`] covers a single process and [`NoopSessionLock`]
//! grants every request.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::SessionResult;

/// The user and workspace a conversation belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionOwner {
    pub user_id: String,
    pub workspace_id: String,
}

impl SessionOwner {
    pub fn new(user_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
        }
    }

    /// Lock key: `session:{user_id}:{workspace_id}`.
    pub fn lock_key(&self) -> String {
        format!("session:{}:{}", self.user_id, self.workspace_id)
    }
}

/// Held lock; released when dropped.
pub struct LockGuard {
    key: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(key: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key: key.into(),
            release: Some(Box::new(release)),
        }
    }

    /// Guard with nothing to release.
    pub fn noop(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            release: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            tracing::trace!(key = %self.key, "Session lock released");
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("releases", &self.release.is_some())
            .finish()
    }
}

/// Mutual exclusion keyed by string.
#[async_trait]
pub trait SessionLock: Send + Sync {
    /// Try to take the lock without waiting. `None` means it is held elsewhere.
    async fn try_lock(&self, key: &str) -> SessionResult<Option<LockGuard>>;
}

/// In-process lock over a set of held keys.
#[derive(Debug, Clone, Default)]
pub struct LocalSessionLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalSessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().is_ok_and(|held| held.contains(key))
    }
}

#[async_trait]
impl SessionLock for LocalSessionLock {
    async fn try_lock(&self, key: &str) -> SessionResult<Option<LockGuard>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| crate::SessionError::Store("session lock poisoned".into()))?;
        if !held.insert(key.to_string()) {
            return Ok(None);
        }

        let set = Arc::clone(&self.held);
        let owned = key.to_string();
        Ok(Some(LockGuard::new(key, move || {
            if let Ok(mut held) = set.lock() {
                held.remove(&owned);
            }
        })))
    }
}

/// Lock that always grants. For single-request processes and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSessionLock;

#[async_trait]
impl SessionLock for NoopSessionLock {
    async fn try_lock(&self, key: &str) -> SessionResult<Option<LockGuard>> {
        Ok(Some(LockGuard::noop(key)))
    }
}
