/// NTFS file system support
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::node::{
    child_path, FileNode, FolderNode, Node, NodeKind, NodeLocator, NodeMetadata, RecoveryStatus,
};
use super::FileSystem;
use crate::config::{ReadPolicy, ScanConfig};
use crate::search::{FolderWalk, MftScan, SearchStrategy};
use crate::stream::{read_all, ArrayBackedStream, FixupStream, SharedStream, SubStream};
use crate::FileSystemType;

// Sub-modules
pub mod attribute;
pub mod bitmap;
pub mod boot;
pub mod index;
pub mod record;
pub mod runs;
pub mod stream;

pub use attribute::{AttributeRecord, AttributeType};
pub use bitmap::ClusterBitmap;
pub use boot::{is_ntfs_boot_sector, NtfsBootSector};
pub use index::DirectoryIndex;
pub use record::{MftRecord, RECORD_BITMAP, RECORD_MFT, RECORD_ROOT};
pub use runs::{Run, RunListError};
pub use stream::RunStream;

use attribute::parse_attribute_list;
use index::FILE_NAME_INDEX;
use record::has_record_magic;

/// A mounted NTFS volume
pub struct NtfsFileSystem {
    label: String,
    volume: SharedStream,
    boot: NtfsBootSector,
    /// Contents of $MFT's data attribute, every record addressable by number
    mft: SharedStream,
    bitmap: Option<ClusterBitmap>,
    config: ScanConfig,
}

impl NtfsFileSystem {
    pub fn mount(volume: SharedStream, label: impl Into<String>, config: &ScanConfig) -> Result<Arc<Self>> {
        let label = label.into();
        let sector = volume
            .get_bytes(0, 512)
            .context("Failed to read NTFS boot sector")?;
        let boot = NtfsBootSector::parse(&sector)?;
        let policy = config.read_policy;

        let mft_record = Self::read_mft_record(&volume, &boot, policy)?;
        let data = mft_record
            .primary_data()
            .context("$MFT record has no data attribute")?;
        let bootstrap = Self::attribute_stream_on(&volume, &boot, data, policy)?;

        let mut fs = NtfsFileSystem {
            label,
            volume,
            boot,
            mft: bootstrap,
            bitmap: None,
            config: config.clone(),
        };

        // A fragmented MFT keeps the rest of its run list in extension records
        if mft_record.attribute(AttributeType::AttributeList, None).is_some() {
            let mut full = mft_record;
            fs.resolve_attribute_list(&mut full)?;
            if let Some(data) = full.primary_data() {
                fs.mft = Self::attribute_stream_on(&fs.volume, &fs.boot, data, policy)?;
            }
        }

        match fs.load_bitmap() {
            Ok(bitmap) => fs.bitmap = Some(bitmap),
            Err(e) => tracing::warn!(
                "{}: cluster bitmap unavailable, recovery chances will be unknown: {}",
                fs.label,
                e
            ),
        }

        tracing::info!(
            "Mounted NTFS volume {}: {} clusters of {} bytes, {} MFT records",
            fs.label,
            fs.boot.total_clusters(),
            fs.boot.cluster_size(),
            fs.record_count()
        );

        Ok(Arc::new(fs))
    }

    /// Record 0 sits at the MFT start cluster and is read straight from the volume
    fn read_mft_record(volume: &SharedStream, boot: &NtfsBootSector, policy: ReadPolicy) -> Result<MftRecord> {
        let raw = SubStream::new(volume.clone(), boot.mft_offset(), boot.mft_record_size as u64)
            .context("MFT start lies outside the volume")?;
        Self::decode_record(raw.shared(), RECORD_MFT, policy)?
            .context("$MFT record is missing or torn")
    }

    /// Magic check, fixups, then header and attribute parsing
    fn decode_record(raw: SharedStream, number: u64, policy: ReadPolicy) -> Result<Option<MftRecord>> {
        if !has_record_magic(raw.as_ref()) {
            return Ok(None);
        }

        let fixed = FixupStream::new(raw)?;
        let torn = !fixed.is_intact();
        if torn {
            if policy.is_strict() {
                tracing::debug!("Discarding record {} with failed fixups", number);
                return Ok(None);
            }
            tracing::debug!(
                "Record {} failed its fixup check (strides {:?}), parsing anyway",
                number,
                fixed.torn_strides()
            );
        }

        MftRecord::parse(Arc::new(fixed), number, torn).map(Some)
    }

    fn attribute_stream_on(
        volume: &SharedStream,
        boot: &NtfsBootSector,
        attr: &AttributeRecord,
        policy: ReadPolicy,
    ) -> Result<SharedStream> {
        match &attr.body {
            attribute::AttributeBody::Resident(value) => Ok(value.clone()),
            attribute::AttributeBody::NonResident(nr) => {
                if let Some(e) = &nr.run_error {
                    anyhow::bail!("Attribute has an invalid run list: {}", e);
                }
                Ok(Arc::new(RunStream::new(
                    volume.clone(),
                    nr.runs.clone(),
                    boot.cluster_size(),
                    nr.data_size,
                    nr.initialized_size,
                    policy,
                )))
            }
        }
    }

    fn load_bitmap(&self) -> Result<ClusterBitmap> {
        let record = self
            .record(RECORD_BITMAP)?
            .context("$Bitmap record is missing")?;
        let stream = self.data_stream(&record, None)?;
        let bits = read_all(stream.as_ref())?;
        Ok(ClusterBitmap::new(bits, self.boot.total_clusters()))
    }

    pub fn boot_sector(&self) -> &NtfsBootSector {
        &self.boot
    }

    pub fn bitmap(&self) -> Option<&ClusterBitmap> {
        self.bitmap.as_ref()
    }

    pub fn volume(&self) -> &SharedStream {
        &self.volume
    }

    /// Number of record slots in the MFT
    pub fn record_count(&self) -> u64 {
        self.mft.length() / self.boot.mft_record_size as u64
    }

    /// Read record `number` without following its attribute list
    fn raw_record(&self, number: u64) -> Result<Option<MftRecord>> {
        if number == RECORD_MFT {
            return Self::read_mft_record(&self.volume, &self.boot, self.config.read_policy).map(Some);
        }

        let size = self.boot.mft_record_size as u64;
        let offset = number
            .checked_mul(size)
            .filter(|offset| offset.checked_add(size).is_some_and(|end| end <= self.mft.length()))
            .with_context(|| format!("Record {} lies past the end of the MFT", number))?;
        let raw = SubStream::new(self.mft.clone(), offset, size)?;
        Self::decode_record(raw.shared(), number, self.config.read_policy)
    }

    /// Read and decode MFT record `number`.
    ///
    /// `Ok(None)` means the slot holds no record (no `FILE` signature, or a
    /// torn record under the strict policy).
    pub fn record(&self, number: u64) -> Result<Option<MftRecord>> {
        let Some(mut record) = self.raw_record(number)? else {
            return Ok(None);
        };
        if !record.is_extension()
            && record.attribute(AttributeType::AttributeList, None).is_some()
        {
            if let Err(e) = self.resolve_attribute_list(&mut record) {
                tracing::warn!("Record {}: attribute list unreadable: {}", number, e);
            }
        }
        Ok(Some(record))
    }

    /// Merge attributes held in extension records into `record`
    fn resolve_attribute_list(&self, record: &mut MftRecord) -> Result<()> {
        let Some(list) = record.attribute(AttributeType::AttributeList, None) else {
            return Ok(());
        };
        let stream = self.attribute_stream(list)?;
        let entries = parse_attribute_list(&read_all(stream.as_ref())?);

        let mut by_segment: BTreeMap<u64, Vec<_>> = BTreeMap::new();
        for entry in &entries {
            if entry.segment_record != record.record_number {
                by_segment.entry(entry.segment_record).or_default().push(entry);
            }
        }

        for (segment, wanted) in by_segment {
            match self.raw_record(segment) {
                Ok(Some(extension)) if extension.base_record == record.record_number => {
                    record.absorb_extension(&extension, &wanted);
                }
                Ok(_) => tracing::debug!(
                    "Record {}: extension {} does not belong to it",
                    record.record_number,
                    segment
                ),
                Err(e) => tracing::debug!(
                    "Record {}: extension {} unreadable: {}",
                    record.record_number,
                    segment,
                    e
                ),
            }
        }
        Ok(())
    }

    /// Byte stream over any attribute's value
    pub fn attribute_stream(&self, attr: &AttributeRecord) -> Result<SharedStream> {
        Self::attribute_stream_on(&self.volume, &self.boot, attr, self.config.read_policy)
    }

    /// Contents of a `$DATA` stream, `None` naming the primary one
    pub fn data_stream(&self, record: &MftRecord, name: Option<&str>) -> Result<SharedStream> {
        let attr = record
            .attribute(AttributeType::Data, name)
            .with_context(|| {
                format!(
                    "Record {} has no data stream {}",
                    record.record_number,
                    name.unwrap_or("(primary)")
                )
            })?;
        self.attribute_stream(attr)
    }

    /// How likely the record's primary data is to still be intact on disk
    pub fn chance_of_recovery(&self, record: &MftRecord) -> RecoveryStatus {
        let Some(data) = record.primary_data() else {
            return RecoveryStatus::Unknown;
        };
        if data.is_resident() {
            return RecoveryStatus::Recoverable;
        }
        if !data.is_valid() {
            return RecoveryStatus::Unknown;
        }
        match &self.bitmap {
            Some(bitmap) => bitmap.classify(data.runs()),
            None => RecoveryStatus::Unknown,
        }
    }

    /// Metadata for a record, as surfaced by scans
    pub fn metadata_for(&self, record: &MftRecord) -> NodeMetadata {
        let kind = if record.is_directory() {
            NodeKind::Folder
        } else if record.data_stream_names().len() > 1 {
            NodeKind::StreamSet
        } else {
            NodeKind::File
        };
        let deleted = !record.is_in_use();
        let size = record
            .primary_data()
            .map(AttributeRecord::data_size)
            .or_else(|| record.file_name.as_ref().map(|name| name.data_size))
            .unwrap_or(0);

        let info = record.standard_info.as_ref();
        let name = record.file_name.as_ref();

        NodeMetadata {
            name: record.name().unwrap_or_default().to_string(),
            path: None,
            size,
            deleted,
            kind,
            id: record.record_number,
            parent_id: record.parent_record(),
            fs_type: FileSystemType::Ntfs,
            // Live files are intact by definition
            recovery: if deleted {
                self.chance_of_recovery(record)
            } else {
                RecoveryStatus::Recoverable
            },
            created: info.and_then(|i| i.created).or(name.and_then(|n| n.created)),
            modified: info.and_then(|i| i.modified).or(name.and_then(|n| n.modified)),
            locator: NodeLocator::Mft {
                record: record.record_number,
                stream: None,
            },
        }
    }

    fn node_for(&self, record: &MftRecord, meta: NodeMetadata) -> Result<Node> {
        match meta.kind {
            NodeKind::File => {
                let stream = if record.primary_data().is_some() {
                    self.data_stream(record, None)?
                } else {
                    ArrayBackedStream::new(Vec::new()).shared()
                };
                Ok(Node::File(FileNode { meta, stream }))
            }
            NodeKind::Folder | NodeKind::StreamSet => Ok(Node::Folder(FolderNode { meta })),
        }
    }

    fn stream_node(&self, record: &MftRecord, parent: &NodeMetadata, stream_name: &str) -> Result<Node> {
        let attr = record
            .attribute(AttributeType::Data, Some(stream_name))
            .with_context(|| format!("Record {} has no stream {}", record.record_number, stream_name))?;
        let name = format!("{}:{}", parent.name, stream_name);
        let meta = NodeMetadata {
            path: parent.path.as_deref().map(|path| format!("{}:{}", path, stream_name)),
            name,
            size: attr.data_size(),
            kind: NodeKind::File,
            recovery: match (parent.deleted, &self.bitmap) {
                (false, _) => RecoveryStatus::Recoverable,
                (true, _) if attr.is_resident() => RecoveryStatus::Recoverable,
                (true, _) if !attr.is_valid() => RecoveryStatus::Unknown,
                (true, Some(bitmap)) => bitmap.classify(attr.runs()),
                (true, None) => RecoveryStatus::Unknown,
            },
            locator: NodeLocator::Mft {
                record: record.record_number,
                stream: Some(stream_name.to_string()),
            },
            ..parent.clone()
        };
        let stream = self.attribute_stream(attr)?;
        Ok(Node::File(FileNode { meta, stream }))
    }

    /// Every stream of a stream-set record, the primary one first
    fn stream_children(&self, record: &MftRecord, folder: &NodeMetadata) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for name in record.data_stream_names() {
            match name {
                None => {
                    let meta = NodeMetadata {
                        kind: NodeKind::File,
                        ..folder.clone()
                    };
                    nodes.push(self.node_for(record, meta)?);
                }
                Some(stream) => nodes.push(self.stream_node(record, folder, &stream)?),
            }
        }
        Ok(nodes)
    }

    pub fn directory_index(&self, record: &MftRecord) -> Result<Option<DirectoryIndex>> {
        let Some(root) = record.attribute(AttributeType::IndexRoot, Some(FILE_NAME_INDEX)) else {
            return Ok(None);
        };
        let value = root.value().context("IndexRoot is not resident")?;
        let allocation = match record.attribute(AttributeType::IndexAllocation, Some(FILE_NAME_INDEX)) {
            Some(attr) => Some(self.attribute_stream(attr)?),
            None => None,
        };
        DirectoryIndex::new(
            record.record_number,
            value.as_ref(),
            allocation,
            self.boot.cluster_size(),
        )
        .map(Some)
    }

    fn folder_record(&self, folder: &FolderNode) -> Result<MftRecord> {
        let NodeLocator::Mft { record, .. } = &folder.meta.locator else {
            anyhow::bail!("{} is not an NTFS node", folder.meta.name);
        };
        self.record(*record)?
            .with_context(|| format!("Record {} is no longer readable", record))
    }

    /// Child node for an index entry, named by the entry's key
    fn entry_node(&self, folder: &FolderNode, entry: &index::IndexEntry) -> Result<Option<Node>> {
        let Some(record) = self.record(entry.record_number())? else {
            return Ok(None);
        };
        if record.is_extension() {
            return Ok(None);
        }
        let mut meta = self.metadata_for(&record);
        if let Some(name) = entry.name() {
            meta.name = name.to_string();
        }
        meta.path = Some(child_path(folder.meta.path.as_deref(), &meta.name));
        self.node_for(&record, meta).map(Some)
    }
}

impl FileSystem for NtfsFileSystem {
    fn fs_type(&self) -> FileSystemType {
        FileSystemType::Ntfs
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn cluster_size(&self) -> u64 {
        self.boot.cluster_size()
    }

    fn describe(&self) -> String {
        let free = self
            .bitmap
            .as_ref()
            .map(|bitmap| bitmap.free_clusters().to_string())
            .unwrap_or_else(|| "?".to_string());
        format!(
            "NTFS  {}  serial {:016X}  {} clusters x {} bytes ({} free), {} MFT records",
            self.label,
            self.boot.serial_number,
            self.boot.total_clusters(),
            self.boot.cluster_size(),
            free,
            self.record_count()
        )
    }

    fn root_id(&self) -> u64 {
        RECORD_ROOT
    }

    fn root(&self) -> Result<FolderNode> {
        let record = self
            .record(RECORD_ROOT)?
            .context("Root directory record is missing")?;
        let mut meta = self.metadata_for(&record);
        meta.name = String::new();
        meta.path = Some("/".to_string());
        meta.kind = NodeKind::Folder;
        Ok(FolderNode { meta })
    }

    fn children(&self, folder: &FolderNode) -> Result<Vec<Node>> {
        let record = self.folder_record(folder)?;
        if folder.meta.kind == NodeKind::StreamSet {
            return self.stream_children(&record, &folder.meta);
        }

        let Some(index) = self.directory_index(&record)? else {
            return Ok(Vec::new());
        };

        let mut nodes = Vec::new();
        for entry in index.entries() {
            match self.entry_node(folder, &entry) {
                Ok(Some(node)) => nodes.push(node),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    "Skipping record {} in {}: {}",
                    entry.record_number(),
                    folder.meta.display_path(),
                    e
                ),
            }
        }
        Ok(nodes)
    }

    fn find_child(&self, folder: &FolderNode, name: &str) -> Result<Option<Node>> {
        let record = self.folder_record(folder)?;
        if folder.meta.kind == NodeKind::StreamSet {
            let nodes = self.stream_children(&record, &folder.meta)?;
            return Ok(nodes
                .into_iter()
                .find(|node| super::node::names_equal(node.name(), name)));
        }

        let Some(index) = self.directory_index(&record)? else {
            return Ok(None);
        };
        match index.find(name)? {
            Some(entry) => self.entry_node(folder, &entry),
            None => Ok(None),
        }
    }

    fn resolve(&self, meta: &NodeMetadata) -> Result<Node> {
        let NodeLocator::Mft { record, stream } = &meta.locator else {
            anyhow::bail!("{} is not an NTFS node", meta.name);
        };
        let loaded = self
            .record(*record)?
            .with_context(|| format!("Record {} is no longer readable", record))?;

        match stream {
            Some(stream) => {
                let base = meta
                    .name
                    .rsplit_once(':')
                    .map(|(base, _)| base.to_string())
                    .unwrap_or_else(|| meta.name.clone());
                let parent = NodeMetadata {
                    name: base,
                    path: meta
                        .path
                        .as_deref()
                        .and_then(|path| path.rsplit_once(':'))
                        .map(|(path, _)| path.to_string()),
                    ..meta.clone()
                };
                self.stream_node(&loaded, &parent, stream)
            }
            None => {
                let mut fresh = self.metadata_for(&loaded);
                fresh.name = meta.name.clone();
                fresh.path = meta.path.clone();
                // Primary stream of a stream set
                if meta.kind == NodeKind::File {
                    fresh.kind = NodeKind::File;
                }
                self.node_for(&loaded, fresh)
            }
        }
    }

    fn search_strategies(self: Arc<Self>) -> Vec<Box<dyn SearchStrategy>> {
        let depth = self.config.max_directory_depth;
        vec![
            Box::new(MftScan::new(self.clone())),
            Box::new(FolderWalk::new(self, depth)),
        ]
    }
}
