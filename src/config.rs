//! Tree and store configuration
//!
//! Stored as JSON, by default in ~/.config/state_tree/config.json. Every
//! field is optional in the file; missing fields take their defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default key length in bytes
pub const DEFAULT_KEY_LENGTH: usize = 38;

/// Default number of trie levels per skip-tree blob
pub const DEFAULT_SUBTREE_HEIGHT: u8 = 4;

/// Settings shared by the tree engines and the file store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Length in bytes of every key in the tree
    pub key_length: usize,
    /// Delete superseded nodes as soon as a new root replaces them. Turn off
    /// to keep older roots readable.
    pub prune: bool,
    /// Rebuild independent subtrees of a batch on the rayon pool
    pub parallel: bool,
    /// Smallest batch (in keys) that is split across threads
    pub parallel_threshold: usize,
    /// Trie levels grouped per blob in the skip tree
    pub subtree_height: u8,
    /// zstd level for large records in the file store, `None` disables it
    pub compression_level: Option<i32>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            key_length: DEFAULT_KEY_LENGTH,
            prune: true,
            parallel: true,
            parallel_threshold: 64,
            subtree_height: DEFAULT_SUBTREE_HEIGHT,
            compression_level: Some(3),
        }
    }
}

impl TreeConfig {
    /// Default location of the config file
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".into()))?;
        Ok(config_dir.join("state_tree").join("config.json"))
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: TreeConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else the
    /// built-in defaults
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Ok(default) if default.exists() => Self::load(default),
            _ => Ok(Self::default()),
        }
    }

    /// Write the config as pretty JSON, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_length == 0 || self.key_length > 1024 {
            return Err(Error::Config(format!(
                "key_length must be between 1 and 1024, got {}",
                self.key_length
            )));
        }
        if !(1..=8).contains(&self.subtree_height) {
            return Err(Error::Config(format!(
                "subtree_height must be between 1 and 8, got {}",
                self.subtree_height
            )));
        }
        if let Some(level) = self.compression_level {
            if !(1..=22).contains(&level) {
                return Err(Error::Config(format!(
                    "compression_level must be between 1 and 22, got {}",
                    level
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "key_length": 32, "prune": false }"#).unwrap();

        let config = TreeConfig::load(&path).unwrap();
        assert_eq!(config.key_length, 32);
        assert!(!config.prune);
        assert_eq!(config.subtree_height, DEFAULT_SUBTREE_HEIGHT);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = TreeConfig {
            parallel: false,
            compression_level: None,
            ..TreeConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(TreeConfig::resolve(Some(&path)).unwrap(), config);
    }

    #[test]
    fn test_validation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "subtree_height": 0 }"#).unwrap();
        assert!(matches!(TreeConfig::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(TreeConfig::load(&path), Err(Error::Config(_))));

        assert!(TreeConfig::default().validate().is_ok());
    }
}
