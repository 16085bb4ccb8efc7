/// FAT12/16/32 file system support
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::node::{child_path, FileNode, FolderNode, Node, NodeKind, NodeLocator, NodeMetadata, RecoveryStatus};
use super::FileSystem;
use crate::config::ScanConfig;
use crate::search::{FatClusterScan, FolderWalk, SearchStrategy};
use crate::stream::{ArrayBackedStream, ByteStream, SharedStream};
use crate::FileSystemType;

// Sub-modules
pub mod boot;
pub mod directory;
pub mod stream;
pub mod table;

pub use boot::{is_fat_boot_sector, BiosParameterBlock, FatType};
pub use directory::{is_directory_start, parse_directory, DirEntry, DirectoryListing};
pub use stream::ClusterChainStream;
pub use table::{ChainEnd, ClusterChain, FatEntry, FatTable};

/// Where a directory's entries are stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryLocation {
    /// Fixed root region of FAT12/16
    FixedRoot,
    Clusters(Vec<u32>),
}

/// Bounded FIFO cache of directory cluster contents
struct ClusterCache {
    capacity: usize,
    clusters: HashMap<u32, Arc<Vec<u8>>>,
    order: VecDeque<u32>,
}

impl ClusterCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clusters: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, cluster: u32) -> Option<Arc<Vec<u8>>> {
        self.clusters.get(&cluster).cloned()
    }

    fn insert(&mut self, cluster: u32, data: Arc<Vec<u8>>) {
        if self.capacity == 0 || self.clusters.contains_key(&cluster) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.clusters.remove(&evicted);
            }
        }
        self.order.push_back(cluster);
        self.clusters.insert(cluster, data);
    }
}

/// A mounted FAT volume
pub struct FatFileSystem {
    label: String,
    volume: SharedStream,
    bpb: BiosParameterBlock,
    table: FatTable,
    config: ScanConfig,
    cache: Mutex<ClusterCache>,
}

impl FatFileSystem {
    pub fn mount(volume: SharedStream, label: impl Into<String>, config: &ScanConfig) -> Result<Arc<Self>> {
        let label = label.into();
        let sector = volume
            .get_bytes(0, 512)
            .context("Failed to read FAT boot sector")?;
        let bpb = BiosParameterBlock::parse(&sector)?;

        if bpb.data_offset() >= volume.length() {
            anyhow::bail!(
                "FAT data region starts at {} but the volume holds {} bytes",
                bpb.data_offset(),
                volume.length()
            );
        }

        let table = FatTable::new(volume.clone(), &bpb, config.max_chain_length);
        let fs = FatFileSystem {
            label,
            volume,
            table,
            config: config.clone(),
            cache: Mutex::new(ClusterCache::new(config.directory_cache_clusters)),
            bpb,
        };

        tracing::info!(
            "Mounted {} volume {}: {} clusters of {} bytes, label {:?}",
            fs.bpb.fat_type,
            fs.label,
            fs.table.cluster_count(),
            fs.bpb.cluster_size(),
            fs.bpb.volume_label
        );

        Ok(Arc::new(fs))
    }

    pub fn boot_sector(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    pub fn table(&self) -> &FatTable {
        &self.table
    }

    pub fn volume(&self) -> &SharedStream {
        &self.volume
    }

    fn is_fat32(&self) -> bool {
        self.bpb.fat_type == FatType::Fat32
    }

    /// Volume offset of a data cluster
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.bpb.data_offset() + (cluster as u64 - 2) * self.bpb.cluster_size()
    }

    /// Highest cluster whose first byte lies inside the volume; images are
    /// often shorter than their boot sector claims
    pub fn last_readable_cluster(&self) -> u32 {
        let data_bytes = self.volume.length().saturating_sub(self.bpb.data_offset());
        let readable = data_bytes.div_ceil(self.bpb.cluster_size());
        (readable + 1).min(self.table.max_cluster() as u64) as u32
    }

    /// Contents of one data cluster, served from the directory cache when possible
    pub fn read_cluster(&self, cluster: u32) -> Result<Arc<Vec<u8>>> {
        if !self.table.is_valid_cluster(cluster) {
            anyhow::bail!("Cluster {} is outside the data region", cluster);
        }
        if let Some(data) = self.cache.lock().get(cluster) {
            return Ok(data);
        }

        let size = self.bpb.cluster_size();
        let offset = self.cluster_offset(cluster);
        let data = if offset + size <= self.volume.length() {
            self.volume.get_bytes(offset, size as usize)?
        } else {
            // Last cluster of a truncated image
            let mut data = self
                .volume
                .get_bytes(offset, self.volume.length().saturating_sub(offset) as usize)?;
            data.resize(size as usize, 0);
            data
        };
        let data = Arc::new(data);
        self.cache.lock().insert(cluster, data.clone());
        Ok(data)
    }

    /// Clusters holding a file's contents.
    ///
    /// Deleted entries have lost their chain, so the data is assumed to be
    /// contiguous from the first cluster.
    fn file_clusters(&self, first_cluster: u32, size: u64, deleted: bool) -> Vec<u32> {
        if !self.table.is_valid_cluster(first_cluster) {
            return Vec::new();
        }
        if deleted {
            let needed = size.div_ceil(self.bpb.cluster_size()).max(1);
            let last = (first_cluster as u64 + needed - 1).min(self.table.max_cluster() as u64) as u32;
            (first_cluster..=last).collect()
        } else {
            self.table.chain(first_cluster).clusters
        }
    }

    pub fn file_stream(&self, first_cluster: u32, size: u32, deleted: bool) -> SharedStream {
        if size == 0 {
            return ArrayBackedStream::new(Vec::new()).shared();
        }
        Arc::new(ClusterChainStream::new(
            self.volume.clone(),
            self.file_clusters(first_cluster, size as u64, deleted),
            self.bpb.cluster_size(),
            self.bpb.data_offset(),
            size as u64,
            self.config.read_policy,
        ))
    }

    /// How likely a deleted entry's data is to still be on disk, judged by
    /// whether the clusters it would occupy are still free in the FAT
    pub fn chance_of_recovery(&self, first_cluster: u32, size: u32, directory: bool) -> RecoveryStatus {
        if size == 0 && !directory {
            return RecoveryStatus::Recoverable;
        }
        if !self.table.is_valid_cluster(first_cluster) {
            return RecoveryStatus::Unknown;
        }
        let clusters = if directory {
            vec![first_cluster]
        } else {
            self.file_clusters(first_cluster, size as u64, true)
        };

        let free = clusters.iter().filter(|c| self.table.is_free(**c)).count();
        if free == clusters.len() {
            RecoveryStatus::ProbablyRecoverable
        } else if free == 0 {
            RecoveryStatus::Overwritten
        } else {
            RecoveryStatus::PartiallyRecoverable
        }
    }

    pub fn root_location(&self) -> DirectoryLocation {
        if self.is_fat32() {
            DirectoryLocation::Clusters(self.table.chain(self.bpb.root_cluster).clusters)
        } else {
            DirectoryLocation::FixedRoot
        }
    }

    /// Clusters of a directory starting at `first_cluster`.
    ///
    /// Free first clusters belong to deleted directories whose chain is gone;
    /// only that first cluster is read.
    pub fn directory_clusters(&self, first_cluster: u32, deleted: bool) -> Vec<u32> {
        if !self.table.is_valid_cluster(first_cluster) {
            return Vec::new();
        }
        if deleted || self.table.is_free(first_cluster) {
            vec![first_cluster]
        } else {
            self.table.chain(first_cluster).clusters
        }
    }

    fn location_of(&self, meta: &NodeMetadata) -> Result<DirectoryLocation> {
        match &meta.locator {
            NodeLocator::FatRoot => Ok(self.root_location()),
            NodeLocator::FatEntry {
                first_cluster,
                directory: true,
                deleted,
                ..
            } => Ok(DirectoryLocation::Clusters(
                self.directory_clusters(*first_cluster, *deleted),
            )),
            _ => anyhow::bail!("{} is not a FAT folder", meta.name),
        }
    }

    fn directory_bytes(&self, location: &DirectoryLocation) -> Result<Vec<u8>> {
        match location {
            DirectoryLocation::FixedRoot => Ok(self
                .volume
                .get_bytes(self.bpb.root_dir_offset(), self.bpb.root_dir_size() as usize)?),
            DirectoryLocation::Clusters(clusters) => {
                let mut data = Vec::with_capacity(clusters.len() * self.bpb.cluster_size() as usize);
                for cluster in clusters {
                    data.extend_from_slice(&self.read_cluster(*cluster)?);
                }
                Ok(data)
            }
        }
    }

    /// Absolute device offset of the entry at `offset` within a directory
    fn entry_device_offset(&self, location: &DirectoryLocation, offset: usize) -> u64 {
        let volume_offset = match location {
            DirectoryLocation::FixedRoot => self.bpb.root_dir_offset() + offset as u64,
            DirectoryLocation::Clusters(clusters) => {
                let cluster_size = self.bpb.cluster_size();
                let index = offset as u64 / cluster_size;
                let cluster = clusters[index as usize];
                self.cluster_offset(cluster) + offset as u64 % cluster_size
            }
        };
        self.volume
            .device_offset_at(volume_offset)
            .unwrap_or(self.volume.device_offset() + volume_offset)
    }

    fn entry_metadata(
        &self,
        entry: &DirEntry,
        location: &DirectoryLocation,
        parent_path: Option<&str>,
        parent_id: u64,
    ) -> NodeMetadata {
        let directory = entry.is_directory();
        NodeMetadata {
            name: entry.name.clone(),
            path: parent_path.map(|parent| child_path(Some(parent), &entry.name)),
            size: if directory { 0 } else { entry.size as u64 },
            deleted: entry.deleted,
            kind: if directory { NodeKind::Folder } else { NodeKind::File },
            id: entry.first_cluster as u64,
            parent_id: Some(parent_id),
            fs_type: self.bpb.fat_type.into(),
            recovery: if entry.deleted {
                self.chance_of_recovery(entry.first_cluster, entry.size, directory)
            } else {
                RecoveryStatus::Recoverable
            },
            created: entry.created,
            modified: entry.modified,
            locator: NodeLocator::FatEntry {
                first_cluster: entry.first_cluster,
                size: entry.size,
                directory,
                deleted: entry.deleted,
                entry_offset: self.entry_device_offset(location, entry.offset),
            },
        }
    }

    /// Decode every entry of a directory
    pub fn list_directory(
        &self,
        location: &DirectoryLocation,
        parent_path: Option<&str>,
        parent_id: u64,
    ) -> Result<Vec<NodeMetadata>> {
        let data = self.directory_bytes(location)?;
        let listing = parse_directory(&data, self.is_fat32());
        if let Some(offset) = listing.halted_at {
            tracing::warn!(
                "{}: directory {} has an invalid entry at offset {}, later entries skipped",
                self.label,
                parent_path.unwrap_or("?"),
                offset
            );
        }
        Ok(listing
            .entries
            .iter()
            .map(|entry| self.entry_metadata(entry, location, parent_path, parent_id))
            .collect())
    }

    /// Entries of the directory starting at `cluster`, if the cluster holds one
    pub fn scan_directory_cluster(&self, cluster: u32) -> Result<Option<Vec<NodeMetadata>>> {
        let data = self.read_cluster(cluster)?;
        if !is_directory_start(&data) {
            return Ok(None);
        }
        let location = DirectoryLocation::Clusters(self.directory_clusters(cluster, false));
        self.list_directory(&location, None, cluster as u64).map(Some)
    }

    fn node_for(&self, meta: NodeMetadata) -> Node {
        match &meta.locator {
            NodeLocator::FatEntry {
                first_cluster,
                size,
                directory: false,
                deleted,
                ..
            } => {
                let stream = self.file_stream(*first_cluster, *size, *deleted);
                Node::File(FileNode { meta, stream })
            }
            _ => Node::Folder(FolderNode { meta }),
        }
    }
}

impl FileSystem for FatFileSystem {
    fn fs_type(&self) -> FileSystemType {
        self.bpb.fat_type.into()
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn cluster_size(&self) -> u64 {
        self.bpb.cluster_size()
    }

    fn describe(&self) -> String {
        format!(
            "{}  {}  id {:04X}-{:04X}  label {:?}  {} clusters x {} bytes ({} free)",
            self.bpb.fat_type,
            self.label,
            self.bpb.volume_id >> 16,
            self.bpb.volume_id & 0xFFFF,
            self.bpb.volume_label,
            self.table.cluster_count(),
            self.bpb.cluster_size(),
            self.table.free_cluster_count()
        )
    }

    fn root_id(&self) -> u64 {
        if self.is_fat32() {
            self.bpb.root_cluster as u64
        } else {
            0
        }
    }

    fn root(&self) -> Result<FolderNode> {
        Ok(FolderNode {
            meta: NodeMetadata {
                name: String::new(),
                path: Some("/".to_string()),
                size: 0,
                deleted: false,
                kind: NodeKind::Folder,
                id: self.root_id(),
                parent_id: None,
                fs_type: self.bpb.fat_type.into(),
                recovery: RecoveryStatus::Recoverable,
                created: None,
                modified: None,
                locator: NodeLocator::FatRoot,
            },
        })
    }

    fn children(&self, folder: &FolderNode) -> Result<Vec<Node>> {
        let location = self.location_of(&folder.meta)?;
        let entries = self.list_directory(&location, folder.meta.path.as_deref(), folder.meta.id)?;
        Ok(entries.into_iter().map(|meta| self.node_for(meta)).collect())
    }

    fn resolve(&self, meta: &NodeMetadata) -> Result<Node> {
        match &meta.locator {
            NodeLocator::FatRoot | NodeLocator::FatEntry { .. } => Ok(self.node_for(meta.clone())),
            NodeLocator::Mft { .. } => anyhow::bail!("{} is not a FAT node", meta.name),
        }
    }

    fn search_strategies(self: Arc<Self>) -> Vec<Box<dyn SearchStrategy>> {
        let depth = self.config.max_directory_depth;
        vec![
            Box::new(FolderWalk::new(self.clone(), depth)),
            Box::new(FatClusterScan::new(self)),
        ]
    }
}
