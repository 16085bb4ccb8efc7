/// Brute-force search for FAT directories
use anyhow::Result;
use std::sync::Arc;

use super::{SearchOutcome, SearchStrategy, Visitor};
use crate::fs::fat::FatFileSystem;
use crate::fs::FileSystem;

/// Lists the root, then parses every data cluster that starts with `.` and
/// `..` entries as a directory. Finds entries of deleted folders the tree
/// no longer reaches; their paths are left for the scanner to rebuild.
pub struct FatClusterScan {
    fs: Arc<FatFileSystem>,
}

impl FatClusterScan {
    pub fn new(fs: Arc<FatFileSystem>) -> Self {
        Self { fs }
    }
}

impl SearchStrategy for FatClusterScan {
    fn name(&self) -> &'static str {
        "cluster-scan"
    }

    fn description(&self) -> &'static str {
        "Parse every directory-looking data cluster"
    }

    fn search(&self, visitor: &mut Visitor<'_>) -> Result<SearchOutcome> {
        let last = self.fs.last_readable_cluster();
        let total = last.saturating_sub(1) as u64;

        let root = self.fs.root()?;
        let entries = self
            .fs
            .list_directory(&self.fs.root_location(), root.meta.path.as_deref(), root.meta.id)?;
        for meta in &entries {
            if !visitor(meta, 0, total) {
                return Ok(SearchOutcome::Stopped);
            }
        }

        for cluster in 2..=last {
            let entries = match self.fs.scan_directory_cluster(cluster) {
                Ok(Some(entries)) => entries,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!("Cluster {} unreadable: {}", cluster, e);
                    continue;
                }
            };
            for meta in &entries {
                if !visitor(meta, cluster as u64 - 1, total) {
                    return Ok(SearchOutcome::Stopped);
                }
            }
        }

        Ok(SearchOutcome::Completed)
    }
}
