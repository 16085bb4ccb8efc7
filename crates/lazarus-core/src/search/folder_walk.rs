/// Depth-first walk of the directory tree from the root
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;

use super::{SearchOutcome, SearchStrategy, Visitor};
use crate::fs::node::{FolderNode, Node, NodeKind};
use crate::fs::FileSystem;

pub struct FolderWalk {
    fs: Arc<dyn FileSystem>,
    max_depth: usize,
}

impl FolderWalk {
    pub fn new(fs: Arc<dyn FileSystem>, max_depth: usize) -> Self {
        Self { fs, max_depth }
    }
}

impl SearchStrategy for FolderWalk {
    fn name(&self) -> &'static str {
        "folder-walk"
    }

    fn description(&self) -> &'static str {
        "Walk directories from the root, including deleted ones"
    }

    fn search(&self, visitor: &mut Visitor<'_>) -> Result<SearchOutcome> {
        let root = self.fs.root()?;
        let mut visited = HashSet::from([root.meta.id]);
        let mut stack: Vec<(FolderNode, usize)> = vec![(root, 0)];
        let mut count = 0u64;

        while let Some((folder, depth)) = stack.pop() {
            let children = match self.fs.children(&folder) {
                Ok(children) => children,
                Err(e) => {
                    tracing::warn!("Cannot list {}: {}", folder.meta.display_path(), e);
                    continue;
                }
            };

            let mut subfolders = Vec::new();
            for child in children {
                count += 1;
                if !visitor(child.meta(), count, 0) {
                    return Ok(SearchOutcome::Stopped);
                }
                if let Node::Folder(sub) = child {
                    if sub.meta.kind == NodeKind::StreamSet {
                        continue;
                    }
                    if depth + 1 >= self.max_depth {
                        tracing::debug!("Not descending below {}", sub.meta.display_path());
                        continue;
                    }
                    if visited.insert(sub.meta.id) {
                        subfolders.push((sub, depth + 1));
                    }
                }
            }
            // Reversed so folders are entered in listing order
            stack.extend(subfolders.into_iter().rev());
        }

        Ok(SearchOutcome::Completed)
    }
}
