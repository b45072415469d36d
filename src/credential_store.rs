//! Credential storage with pluggable backends and best-effort mirrors

use crate::error::Result;
use crate::mirror::CredentialMirror;
use crate::types::{CredentialRecord, UserProfile};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where the credential record is persisted
///
/// Backends hold the record as a whole; there are no field-level updates.
pub trait CredentialBackend: Send + Sync {
    fn load(&self) -> Result<Option<CredentialRecord>>;

    fn store(&self, record: &CredentialRecord) -> Result<()>;

    /// Remove the record; removing an absent record succeeds
    fn remove(&self) -> Result<()>;
}

/// In-process backend, last write wins
#[derive(Default)]
pub struct MemoryBackend {
    slot: ArcSwapOption<CredentialRecord>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialBackend for MemoryBackend {
    fn load(&self) -> Result<Option<CredentialRecord>> {
        Ok(self.slot.load_full().map(|record| (*record).clone()))
    }

    fn store(&self, record: &CredentialRecord) -> Result<()> {
        self.slot.store(Some(Arc::new(record.clone())));
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        self.slot.store(None);
        Ok(())
    }
}

/// JSON file backend with atomic writes (write tmp + rename)
///
/// The record is cached in memory after the first load so reads don't touch disk.
pub struct FileBackend {
    path: PathBuf,
    cache: ArcSwapOption<CredentialRecord>,
}

impl FileBackend {
    /// Open a backend at `path`, loading an existing record if present
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let existing = match std::fs::read_to_string(&path) {
            Ok(contents) => Some(Arc::new(serde_json::from_str::<CredentialRecord>(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            cache: ArcSwapOption::new(existing),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomic(&self, json: &str) -> Result<()> {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_name = format!(
            "{}.{}.{}.tmp",
            self.path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id(),
            seq,
        );
        let tmp_path = self.path.with_file_name(tmp_name);
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl CredentialBackend for FileBackend {
    fn load(&self) -> Result<Option<CredentialRecord>> {
        Ok(self.cache.load_full().map(|record| (*record).clone()))
    }

    fn store(&self, record: &CredentialRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        self.write_atomic(&json)?;
        self.cache.store(Some(Arc::new(record.clone())));
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        self.cache.store(None);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared credential store
///
/// Cheap to clone; all clones see the same backend and mirrors.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn CredentialBackend>,
    mirrors: Arc<Vec<Arc<dyn CredentialMirror>>>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn CredentialBackend>) -> Self {
        Self {
            backend,
            mirrors: Arc::new(Vec::new()),
        }
    }

    /// Store backed by process memory only
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Register mirrors that follow every save and clear
    pub fn with_mirrors(mut self, mirrors: Vec<Arc<dyn CredentialMirror>>) -> Self {
        self.mirrors = Arc::new(mirrors);
        self
    }

    /// Current record, if any
    ///
    /// A backend read failure is logged and reported as absent.
    pub fn get(&self) -> Option<CredentialRecord> {
        match self.backend.load() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Failed to load credentials");
                None
            }
        }
    }

    /// Replace the stored record and update mirrors
    pub fn save(&self, record: CredentialRecord) -> Result<()> {
        self.backend.store(&record)?;
        debug!(expires_at = %record.expires_at, "Credentials saved");

        for mirror in self.mirrors.iter() {
            if let Err(e) = mirror.publish(&record) {
                warn!(error = %e, "Failed to update credential mirror");
            }
        }
        Ok(())
    }

    /// Remove the stored record and revoke mirrors
    ///
    /// Mirrors are revoked even if the backend removal fails.
    pub fn clear(&self) -> Result<()> {
        let removed = self.backend.remove();

        for mirror in self.mirrors.iter() {
            if let Err(e) = mirror.revoke() {
                warn!(error = %e, "Failed to revoke credential mirror");
            }
        }

        debug!("Credentials cleared");
        removed
    }

    pub fn access_token(&self) -> Option<String> {
        self.get().map(|record| record.access_token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.get().map(|record| record.refresh_token)
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.get().and_then(|record| record.user)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.get().map(|record| record.expires_at)
    }

    pub fn is_authenticated(&self) -> bool {
        self.get().is_some_and(|record| !record.access_token.is_empty())
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
