//! Scan configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What to do when the device cannot deliver bytes a structure points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReadPolicy {
    /// Zero-fill failed device reads and unmapped ranges, keep torn records
    #[default]
    BestEffort,
    /// Surface every such condition as an error
    Strict,
}

impl ReadPolicy {
    pub fn is_strict(self) -> bool {
        self == ReadPolicy::Strict
    }
}

/// Scanner and engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub read_policy: ReadPolicy,
    /// Visited nodes between progress events
    pub progress_interval: u64,
    /// Hard cap on FAT chain length, on top of the volume's cluster count
    pub max_chain_length: u32,
    /// Folder walks stop descending below this depth
    pub max_directory_depth: usize,
    /// Deleted names ending in one of these are not reported
    pub noise_suffixes: Vec<String>,
    /// Strategy name to run instead of the filesystem's default
    pub strategy: Option<String>,
    /// Directory clusters kept in the FAT engine's cache
    pub directory_cache_clusters: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            read_policy: ReadPolicy::BestEffort,
            progress_interval: 100,
            max_chain_length: 0x0FFF_FFF7,
            max_directory_depth: 64,
            noise_suffixes: vec![
                ".manifest".to_string(),
                ".mum".to_string(),
                ".cat".to_string(),
            ],
            strategy: None,
            directory_cache_clusters: 256,
        }
    }
}

impl ScanConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// True when `name` ends with a configured noise suffix (case-insensitive)
    pub fn is_noise(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.noise_suffixes
            .iter()
            .any(|suffix| lower.ends_with(&suffix.to_ascii_lowercase()))
    }
}
