//! Path reconstruction after a scan
//!
//! Scans that do not walk the tree (MFT and cluster scans) only know each
//! node's parent id. The links are recorded while scanning and followed once
//! the scan completes. A path that reaches the root is absolute
//! (`/docs/secret.txt`); one whose chain breaks is relative (`docs/secret.txt`).

use std::collections::{HashMap, HashSet};

use crate::fs::node::NodeMetadata;

#[derive(Debug, Clone)]
struct Link {
    parent: Option<u64>,
    name: String,
    deleted: bool,
}

#[derive(Debug, Default)]
pub struct PathResolver {
    root_id: u64,
    /// Record files as well as folders (NTFS ids are unique per record)
    record_files: bool,
    links: HashMap<u64, Link>,
}

impl PathResolver {
    pub fn new(root_id: u64, record_files: bool) -> Self {
        Self {
            root_id,
            record_files,
            links: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Remember `meta`'s parent and name. A live entry replaces a deleted
    /// one with the same id, never the other way round.
    pub fn record(&mut self, meta: &NodeMetadata) {
        if meta.id == self.root_id || meta.name.is_empty() {
            return;
        }
        if !self.record_files && !meta.is_folder() {
            return;
        }
        let link = Link {
            parent: meta.parent_id,
            name: meta.name.clone(),
            deleted: meta.deleted,
        };
        match self.links.get(&meta.id) {
            Some(existing) if !existing.deleted || link.deleted => {}
            _ => {
                self.links.insert(meta.id, link);
            }
        }
    }

    /// Path of `meta` built from the recorded links
    pub fn resolve(&self, meta: &NodeMetadata) -> String {
        let mut segments = vec![meta.name.as_str()];
        let mut seen = HashSet::from([meta.id]);
        let mut current = meta.parent_id;

        let complete = loop {
            let Some(id) = current else {
                break false;
            };
            if id == self.root_id {
                break true;
            }
            if !seen.insert(id) {
                tracing::debug!("Parent cycle at id {} while resolving {}", id, meta.name);
                break false;
            }
            match self.links.get(&id) {
                Some(link) => {
                    segments.push(&link.name);
                    current = link.parent;
                }
                None => break false,
            }
        };

        segments.reverse();
        let joined = segments.join("/");
        if complete {
            format!("/{}", joined)
        } else {
            joined
        }
    }

    /// Fill in every missing path
    pub fn resolve_all(&self, results: &mut [NodeMetadata]) {
        for meta in results.iter_mut().filter(|meta| meta.path.is_none()) {
            meta.path = Some(self.resolve(meta));
        }
    }
}
