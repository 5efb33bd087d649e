//! Persistence backends for configuration documents
//!
//! The configuration store writes every mutation through a [`ConfigBackend`].
//! `MemoryBackend` keeps nothing; `JsonDirBackend` keeps one pretty-printed
//! JSON file per encoder in a state directory.

use crate::store::Configuration;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable home for configuration documents
pub trait ConfigBackend: Send + Sync {
    fn load_all(&self) -> Result<Vec<Configuration>, StorageError>;
    fn save(&self, config: &Configuration) -> Result<(), StorageError>;
    fn remove(&self, encoder_id: &str) -> Result<(), StorageError>;
}

/// Backend that persists nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBackend;

impl ConfigBackend for MemoryBackend {
    fn load_all(&self) -> Result<Vec<Configuration>, StorageError> {
        Ok(Vec::new())
    }

    fn save(&self, _config: &Configuration) -> Result<(), StorageError> {
        Ok(())
    }

    fn remove(&self, _encoder_id: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

/// One `<encoder id>.json` file per document
#[derive(Debug, Clone)]
pub struct JsonDirBackend {
    state_dir: PathBuf,
}

impl JsonDirBackend {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn path_for(&self, encoder_id: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}.json", file_stem_for(encoder_id)))
    }
}

/// Encoder ids are caller supplied; anything outside `[A-Za-z0-9_-]` is
/// percent-encoded so an id can never escape the state directory.
fn file_stem_for(encoder_id: &str) -> String {
    let mut stem = String::with_capacity(encoder_id.len());
    for byte in encoder_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

fn load_config_from_file(path: &Path) -> Result<Configuration, StorageError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

impl ConfigBackend for JsonDirBackend {
    /// Loads every `.json` document in the state directory
    ///
    /// Files that fail to parse are skipped with a warning.
    fn load_all(&self) -> Result<Vec<Configuration>, StorageError> {
        if !self.state_dir.exists() {
            return Ok(Vec::new());
        }

        let mut configs = Vec::new();
        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();

            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match load_config_from_file(&path) {
                Ok(config) => configs.push(config),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable configuration"
                    );
                }
            }
        }

        Ok(configs)
    }

    fn save(&self, config: &Configuration) -> Result<(), StorageError> {
        fs::create_dir_all(&self.state_dir)?;
        let json = serde_json::to_string_pretty(config)?;

        // Write then rename so a crash never leaves a truncated document
        let path = self.path_for(&config.encoder_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, encoder_id: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(encoder_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
