// src/lock/mod.rs

//! Non-blocking mutual exclusion with TTL auto-release.
//!
//! Acquisition never waits: `None` from [`try_lock`] means another worker
//! already owns the unit of work and the caller should do nothing.
//!
//! - [`memory::MemoryLockService`] for a single process.
//! - [`file::FileLockService`] for several processes sharing a directory.

pub mod file;
pub mod memory;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::errors::Result;

pub use file::FileLockService;
pub use memory::MemoryLockService;

/// Backend for named, expiring locks.
pub trait LockService: Send + Sync + Debug {
    /// Try to take `name` for `ttl`. Returns the owner token on success.
    ///
    /// A held lock whose ttl has lapsed counts as free.
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>>;

    /// Release `name` if it is still owned by `token`.
    fn release(&self, name: &str, token: &str) -> Result<()>;
}

/// Held lock; released when dropped, including during unwinding.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    name: String,
    token: String,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.service.release(&self.name, &self.token) {
            warn!(lock = %self.name, error = %e, "failed to release lock; it will expire");
        } else {
            trace!(lock = %self.name, "lock released");
        }
    }
}

/// Scoped critical section: `Some(guard)` if acquired, `None` if busy.
pub fn try_lock(
    service: &Arc<dyn LockService>,
    name: &str,
    ttl: Duration,
) -> Result<Option<LockGuard>> {
    let token = service.try_acquire(name, ttl)?;
    Ok(token.map(|token| {
        trace!(lock = %name, ?ttl, "lock acquired");
        LockGuard {
            service: Arc::clone(service),
            name: name.to_string(),
            token,
        }
    }))
}

/// Lock name guarding execution of one component of a resource.
pub fn component_lock_name(resource_id: &str, component: &str) -> String {
    format!("component:{resource_id}:{component}")
}
