// src/lock/memory.rs

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::errors::Result;
use crate::lock::LockService;

#[derive(Debug)]
struct Held {
    token: String,
    expires_at: Instant,
}

/// Locks held in process memory.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockService for MemoryLockService {
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if held.get(name).is_some_and(|h| h.expires_at > now) {
            return Ok(None);
        }

        let token = Uuid::new_v4().to_string();
        held.insert(
            name.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    fn release(&self, name: &str, token: &str) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.get(name).is_some_and(|h| h.token == token) {
            held.remove(name);
        }
        Ok(())
    }
}
