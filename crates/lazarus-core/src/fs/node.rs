//! Filesystem node model
//!
//! `NodeMetadata` is the lightweight view surfaced while scanning; `Node` is
//! what a filesystem resolves it to when the caller wants to browse folders or
//! read file contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stream::SharedStream;
use crate::FileSystemType;

/// How likely it is that a deleted file's contents are still on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryStatus {
    /// Data lives inside the metadata record itself
    Recoverable,
    /// Every referenced cluster is currently free
    ProbablyRecoverable,
    /// Some referenced clusters have been reallocated
    PartiallyRecoverable,
    /// Every referenced cluster has been reallocated
    Overwritten,
    Unknown,
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RecoveryStatus::Recoverable => "recoverable",
            RecoveryStatus::ProbablyRecoverable => "probably recoverable",
            RecoveryStatus::PartiallyRecoverable => "partially recoverable",
            RecoveryStatus::Overwritten => "overwritten",
            RecoveryStatus::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Folder,
    /// An NTFS record with alternate data streams, browsable as a folder
    StreamSet,
}

/// Where a node lives, in the owning filesystem's own terms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLocator {
    Mft {
        record: u64,
        /// Named `$DATA` stream, `None` for the primary stream
        stream: Option<String>,
    },
    FatRoot,
    FatEntry {
        first_cluster: u32,
        size: u32,
        directory: bool,
        deleted: bool,
        /// Absolute device offset of the 32-byte short entry
        entry_offset: u64,
    },
}

/// Metadata-only view of a file or folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub name: String,
    /// Full path when known; relative paths mean the ancestry is incomplete
    pub path: Option<String>,
    pub size: u64,
    pub deleted: bool,
    pub kind: NodeKind,
    /// MFT record number (NTFS) or first cluster (FAT)
    pub id: u64,
    pub parent_id: Option<u64>,
    pub fs_type: FileSystemType,
    pub recovery: RecoveryStatus,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub locator: NodeLocator,
}

impl NodeMetadata {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, NodeKind::Folder | NodeKind::StreamSet)
    }

    /// Path if known, otherwise the bare name
    pub fn display_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

/// A file with its contents reachable through the byte stream layer
#[derive(Debug, Clone)]
pub struct FileNode {
    pub meta: NodeMetadata,
    pub stream: SharedStream,
}

impl FileNode {
    pub fn len(&self) -> u64 {
        self.stream.length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `buf.len()` bytes at `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> crate::stream::StreamResult<()> {
        self.stream.read_at(offset, buf)
    }
}

/// A folder; children are enumerated lazily by the owning filesystem
#[derive(Debug, Clone)]
pub struct FolderNode {
    pub meta: NodeMetadata,
}

#[derive(Debug, Clone)]
pub enum Node {
    File(FileNode),
    Folder(FolderNode),
}

impl Node {
    pub fn meta(&self) -> &NodeMetadata {
        match self {
            Node::File(file) => &file.meta,
            Node::Folder(folder) => &folder.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut NodeMetadata {
        match self {
            Node::File(file) => &mut file.meta,
            Node::Folder(folder) => &mut folder.meta,
        }
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn into_meta(self) -> NodeMetadata {
        match self {
            Node::File(file) => file.meta,
            Node::Folder(folder) => folder.meta,
        }
    }
}

/// Join a parent path and a child name with `/`
pub fn child_path(parent: Option<&str>, name: &str) -> String {
    match parent {
        None | Some("") => format!("/{}", name),
        Some("/") => format!("/{}", name),
        Some(parent) => format!("{}/{}", parent.trim_end_matches('/'), name),
    }
}

/// Case-insensitive name comparison used by directory lookups
pub fn names_equal(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_uppercase)
        .eq(b.chars().flat_map(char::to_uppercase))
}
