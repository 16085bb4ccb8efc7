/// File system detection and module organization
use anyhow::Result;
use std::sync::Arc;

pub mod common;
pub mod fat;
pub mod node;
pub mod ntfs;
pub mod partition;

use crate::config::ScanConfig;
use crate::search::SearchStrategy;
use crate::stream::{ByteStream, SharedStream};
use crate::FileSystemType;
use node::{names_equal, FolderNode, Node, NodeMetadata};

/// A mounted volume that can be browsed, scanned and read from
pub trait FileSystem: Send + Sync {
    fn fs_type(&self) -> FileSystemType;

    fn label(&self) -> &str;

    fn cluster_size(&self) -> u64;

    /// One-line human readable summary
    fn describe(&self) -> String;

    /// Id carried by the root folder's metadata
    fn root_id(&self) -> u64;

    fn root(&self) -> Result<FolderNode>;

    fn children(&self, folder: &FolderNode) -> Result<Vec<Node>>;

    fn find_child(&self, folder: &FolderNode, name: &str) -> Result<Option<Node>> {
        Ok(self
            .children(folder)?
            .into_iter()
            .find(|child| names_equal(child.name(), name)))
    }

    /// Turn scan metadata back into a readable node
    fn resolve(&self, meta: &NodeMetadata) -> Result<Node>;

    /// Available strategies, the default first
    fn search_strategies(self: Arc<Self>) -> Vec<Box<dyn SearchStrategy>>;
}

/// Detect the file system on a volume from its first sector
pub fn detect_filesystem(stream: &dyn ByteStream) -> Option<FileSystemType> {
    let sector = stream.get_bytes(0, 512).ok()?;

    if ntfs::is_ntfs_boot_sector(&sector) {
        return Some(FileSystemType::Ntfs);
    }

    if fat::is_fat_boot_sector(&sector) {
        if let Ok(bpb) = fat::BiosParameterBlock::parse(&sector) {
            return Some(bpb.fat_type.into());
        }
    }

    None
}

/// Mount whatever file system the volume holds.
///
/// Unrecognised or empty volumes are `Ok(None)`; a recognised volume that
/// fails to mount is an error.
pub fn try_load(
    stream: SharedStream,
    label: &str,
    config: &ScanConfig,
) -> Result<Option<Arc<dyn FileSystem>>> {
    if stream.length() < 512 {
        return Ok(None);
    }

    match detect_filesystem(stream.as_ref()) {
        Some(FileSystemType::Ntfs) => {
            let fs: Arc<dyn FileSystem> = ntfs::NtfsFileSystem::mount(stream, label, config)?;
            Ok(Some(fs))
        }
        Some(_) => {
            let fs: Arc<dyn FileSystem> = fat::FatFileSystem::mount(stream, label, config)?;
            Ok(Some(fs))
        }
        None => {
            tracing::debug!("{}: no recognised file system", label);
            Ok(None)
        }
    }
}

/// Follow a `/`-separated path from the root folder
pub fn open_path(fs: &dyn FileSystem, path: &str) -> Result<Option<Node>> {
    let mut current = Node::Folder(fs.root()?);

    for part in path.split('/').filter(|part| !part.is_empty()) {
        let Node::Folder(folder) = current else {
            return Ok(None);
        };
        match fs.find_child(&folder, part)? {
            Some(child) => current = child,
            None => return Ok(None),
        }
    }

    Ok(Some(current))
}
