// src/lock/file.rs

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{FlowError, Result};
use crate::lock::LockService;

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    token: String,
    expires_at_ms: i64,
}

/// Locks stored as files in a shared directory.
///
/// Acquisition uses `create_new`, which the OS guarantees only one caller
/// wins. An expired lock file is removed and the create is retried once;
/// that takeover is not atomic across processes, so ttls should comfortably
/// exceed job runtimes.
#[derive(Debug)]
pub struct FileLockService {
    dir: PathBuf,
}

impl FileLockService {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", encode_name(name)))
    }

    fn create(&self, path: &Path, ttl: Duration) -> Result<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let body = LockFile {
            token: token.clone(),
            expires_at_ms: Utc::now().timestamp_millis().saturating_add(ttl_ms),
        };

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(&serde_json::to_vec(&body)?)?;
                file.sync_all()?;
                Ok(Some(token))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// `None` if the file vanished in the meantime.
    fn read(&self, path: &Path) -> Result<Option<LockFile>> {
        match fs::read_to_string(path) {
            // A lock file caught mid-write reads as empty; treat it as live.
            Ok(s) if s.is_empty() => Ok(Some(LockFile {
                token: String::new(),
                expires_at_ms: i64::MAX,
            })),
            Ok(s) => serde_json::from_str(&s).map(Some).map_err(FlowError::from),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl LockService for FileLockService {
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>> {
        let path = self.path_for(name);
        if let Some(token) = self.create(&path, ttl)? {
            return Ok(Some(token));
        }

        let expired = match self.read(&path)? {
            Some(existing) => existing.expires_at_ms <= Utc::now().timestamp_millis(),
            None => true,
        };
        if !expired {
            return Ok(None);
        }

        debug!(lock = %name, "taking over expired lock");
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.create(&path, ttl)
    }

    fn release(&self, name: &str, token: &str) -> Result<()> {
        let path = self.path_for(name);
        match self.read(&path)? {
            Some(existing) if existing.token == token => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            _ => Ok(()),
        }
    }
}

/// Make a lock name safe as a file name; reversible so names never collide.
fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
