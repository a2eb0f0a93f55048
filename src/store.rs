//! Buffer persistence
//!
//! Provides pluggable storage for the buffered message set so it survives
//! process restarts. The buffer saves a full snapshot after every mutation
//! and loads once at construction.

use crate::error::{RelayError, Result};
use crate::types::Message;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Trait for persisting the buffered message set
pub trait MessageStore: Send + Sync {
    /// Replace the stored set with `messages`
    fn save(&self, messages: &[Message]) -> Result<()>;

    /// Load the stored set
    ///
    /// A store that has never been written loads as empty. Unparseable
    /// contents are reported as `RelayError::Serialization` so the caller can
    /// decide to start fresh.
    fn load(&self) -> Result<Vec<Message>>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// JSON file-based message store
///
/// Persists the buffer as a JSON array of messages. Writes go to a sibling
/// temp file which is then renamed over the target, so readers only ever see
/// a complete file.
pub struct FileMessageStore {
    path: PathBuf,
}

impl FileMessageStore {
    /// Create a new file store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the temp file used during writes (`<path>.tmp`)
    pub fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl MessageStore for FileMessageStore {
    fn save(&self, messages: &[Message]) -> Result<()> {
        let json = serde_json::to_vec(messages)?;
        let tmp_path = self.tmp_path();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RelayError::storage(
                        parent.display(),
                        format!("failed to create directory: {}", e),
                    )
                })?;
            }
        }

        let mut file = std::fs::File::create(&tmp_path).map_err(|e| {
            RelayError::storage(tmp_path.display(), format!("failed to create temp file: {}", e))
        })?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                RelayError::storage(tmp_path.display(), format!("failed to write temp file: {}", e))
            })?;
        drop(file);

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            RelayError::storage(
                self.path.display(),
                format!("failed to rename {} → {}: {}", tmp_path.display(), self.path.display(), e),
            )
        })?;

        tracing::debug!(path = %self.path.display(), count = messages.len(), "Buffer saved");
        Ok(())
    }

    fn load(&self) -> Result<Vec<Message>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "No existing buffer file, starting fresh");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(RelayError::storage(
                    self.path.display(),
                    format!("failed to read buffer file: {}", e),
                ))
            }
        };

        let messages: Vec<Message> = serde_json::from_slice(&data)?;

        tracing::debug!(
            path = %self.path.display(),
            count = messages.len(),
            "Buffer loaded"
        );
        Ok(messages)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory message store for testing
///
/// Keeps the last saved snapshot and counts saves. Lost on drop.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: std::sync::RwLock<Vec<Message>>,
    saves: AtomicUsize,
}

impl MemoryMessageStore {
    /// Create a store pre-populated with `messages`, as if loaded from disk
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: std::sync::RwLock::new(messages),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of completed saves
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The last saved snapshot
    pub fn snapshot(&self) -> Result<Vec<Message>> {
        self.load()
    }
}

impl MessageStore for MemoryMessageStore {
    fn save(&self, messages: &[Message]) -> Result<()> {
        let mut state = self
            .messages
            .write()
            .map_err(|e| RelayError::Lock(format!("memory store: {}", e)))?;
        *state = messages.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<Vec<Message>> {
        let state = self
            .messages
            .read()
            .map_err(|e| RelayError::Lock(format!("memory store: {}", e)))?;
        Ok(state.clone())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
