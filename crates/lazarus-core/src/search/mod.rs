//! Pluggable traversal algorithms
//!
//! A filesystem hands out an ordered list of strategies, the default first.
//! Every strategy reports each node it meets to a visitor together with a
//! `(current, total)` position; the visitor returns `false` to stop.

use anyhow::Result;
use std::sync::Arc;

pub mod cluster_scan;
pub mod folder_walk;
pub mod mft_scan;

pub use cluster_scan::FatClusterScan;
pub use folder_walk::FolderWalk;
pub use mft_scan::MftScan;

use crate::fs::node::{names_equal, NodeMetadata};
use crate::fs::FileSystem;

/// Callback receiving `(metadata, current, total)`; `total` is 0 when unknown
pub type Visitor<'a> = dyn FnMut(&NodeMetadata, u64, u64) -> bool + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Every reachable node was visited
    Completed,
    /// The visitor asked to stop
    Stopped,
}

pub trait SearchStrategy: Send + Sync {
    /// Short identifier, as accepted by `--strategy`
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn search(&self, visitor: &mut Visitor<'_>) -> Result<SearchOutcome>;
}

/// Pick a strategy by name, or the filesystem's default
pub fn select_strategy(fs: Arc<dyn FileSystem>, name: Option<&str>) -> Option<Box<dyn SearchStrategy>> {
    let mut strategies = fs.search_strategies();
    match name {
        Some(name) => strategies
            .into_iter()
            .find(|strategy| strategy.name().eq_ignore_ascii_case(name)),
        None if strategies.is_empty() => None,
        None => Some(strategies.remove(0)),
    }
}

/// First node the strategy visits whose name matches, deleted or not
pub fn find_by_name(strategy: &dyn SearchStrategy, name: &str) -> Result<Option<NodeMetadata>> {
    let mut found = None;
    strategy.search(&mut |meta: &NodeMetadata, _, _| {
        if names_equal(&meta.name, name) {
            found = Some(meta.clone());
            return false;
        }
        true
    })?;
    Ok(found)
}
