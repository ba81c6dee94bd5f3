//! Storage collaborators: the persisted credential store and the
//! session-scoped page-load marker.
//!
//! The coordinator only reads and clears credentials. The page-load marker is
//! the single piece of state that must survive a reload, which is why it is
//! a wall-clock timestamp rather than a monotonic instant.

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{GuardError, Result};
use crate::lock_state;

pub trait CredentialStore: Send + Sync {
    fn has_credentials(&self) -> bool;
    fn clear(&self);
}

pub trait SessionStorage: Send + Sync {
    fn page_load_marker(&self) -> Option<DateTime<Utc>>;
    fn set_page_load_marker(&self, at: DateTime<Utc>);
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementations
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    token: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *lock_state(&self.token) = Some(token.into());
    }

    pub fn token(&self) -> Option<String> {
        lock_state(&self.token).clone()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn has_credentials(&self) -> bool {
        lock_state(&self.token).is_some()
    }

    fn clear(&self) {
        *lock_state(&self.token) = None;
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    marker: Mutex<Option<DateTime<Utc>>>,
}

impl SessionStorage for MemorySessionStorage {
    fn page_load_marker(&self) -> Option<DateTime<Utc>> {
        *lock_state(&self.marker)
    }

    fn set_page_load_marker(&self, at: DateTime<Utc>) {
        *lock_state(&self.marker) = Some(at);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File-backed session storage
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    last_page_load: Option<DateTime<Utc>>,
}

/// Session storage persisted as a small JSON file, for hosts (and the
/// simulator) that need the marker to outlive the process.
///
/// Read failures degrade to "no marker"; write failures are logged.
#[derive(Debug, Clone)]
pub struct FileSessionStorage {
    path: PathBuf,
}

impl FileSessionStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<SessionFile> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SessionFile::default())
            }
            Err(source) => {
                return Err(GuardError::Io {
                    context: "Failed to read session storage".to_string(),
                    source,
                })
            }
        };

        serde_json::from_slice(&data).map_err(|source| GuardError::Json {
            context: format!("Failed to parse {}", self.path.display()),
            source,
        })
    }

    fn save(&self, file: &SessionFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| GuardError::Io {
                context: "Failed to create session storage dir".to_string(),
                source,
            })?;
        }

        let payload = serde_json::to_vec_pretty(file).map_err(|source| GuardError::Json {
            context: "Failed to serialize session storage".to_string(),
            source,
        })?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, payload).map_err(|source| GuardError::Io {
            context: "Failed to write session storage".to_string(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| GuardError::Io {
            context: "Failed to commit session storage".to_string(),
            source,
        })
    }
}

impl SessionStorage for FileSessionStorage {
    fn page_load_marker(&self) -> Option<DateTime<Utc>> {
        match self.load() {
            Ok(file) => file.last_page_load,
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring unreadable session storage");
                None
            }
        }
    }

    fn set_page_load_marker(&self, at: DateTime<Utc>) {
        let file = SessionFile {
            last_page_load: Some(at),
        };
        if let Err(err) = self.save(&file) {
            tracing::warn!(error = %err, "Failed to persist page-load marker");
        }
    }
}
