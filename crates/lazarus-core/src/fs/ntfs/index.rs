/// Directory indexes ($I30): the inline IndexRoot node and INDX buffers
use anyhow::Result;
use std::cmp::Ordering;
use std::collections::HashSet;

use super::attribute::FileNameAttr;
use crate::stream::{ByteStream, FixupStream, SharedStream, SubStream};

pub const INDEX_BUFFER_MAGIC: &[u8; 4] = b"INDX";
/// Name of the filename index on directories
pub const FILE_NAME_INDEX: &str = "$I30";

pub const INDEX_ENTRY_HAS_CHILD: u32 = 0x01;
pub const INDEX_ENTRY_LAST: u32 = 0x02;

/// Offset of the node header inside an INDX buffer
const BUFFER_NODE_HEADER: u64 = 0x18;
/// Offset of the node header inside the IndexRoot value
const ROOT_NODE_HEADER: u64 = 0x10;
/// Guards against corrupt buffers that point back up the tree
const MAX_INDEX_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub file_reference: u64,
    pub flags: u32,
    pub key: Option<FileNameAttr>,
    pub child_vcn: Option<u64>,
}

impl IndexEntry {
    pub fn record_number(&self) -> u64 {
        self.file_reference & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn sequence_number(&self) -> u16 {
        (self.file_reference >> 48) as u16
    }

    pub fn is_last(&self) -> bool {
        self.flags & INDEX_ENTRY_LAST != 0
    }

    pub fn name(&self) -> Option<&str> {
        self.key.as_ref().map(|key| key.name.as_str())
    }
}

/// Parse the entries of one index node, the terminating entry included
pub fn parse_node(stream: &dyn ByteStream, header: u64) -> Result<Vec<IndexEntry>> {
    let entries_offset = stream.get_u32(header)? as u64;
    let total_size = stream.get_u32(header + 4)? as u64;
    let end = (header + total_size).min(stream.length());

    let mut entries = Vec::new();
    let mut pos = header + entries_offset;
    while pos + 0x10 <= end {
        let file_reference = stream.get_u64(pos)?;
        let length = stream.get_u16(pos + 0x08)? as u64;
        let key_length = stream.get_u16(pos + 0x0A)? as u64;
        let flags = stream.get_u32(pos + 0x0C)?;

        if length < 0x10 || pos + length > end {
            tracing::debug!("Index entry at 0x{:x} has bad length {}", pos, length);
            break;
        }

        let key = if flags & INDEX_ENTRY_LAST == 0 && key_length >= 0x42 && 0x10 + key_length <= length
        {
            let raw = stream.get_bytes(pos + 0x10, key_length as usize)?;
            FileNameAttr::parse(&raw).ok()
        } else {
            None
        };

        let child_vcn = if flags & INDEX_ENTRY_HAS_CHILD != 0 && length >= 0x18 {
            Some(stream.get_u64(pos + length - 8)?)
        } else {
            None
        };

        let entry = IndexEntry {
            file_reference,
            flags,
            key,
            child_vcn,
        };
        let last = entry.is_last();
        entries.push(entry);
        if last {
            break;
        }
        pos += length;
    }

    Ok(entries)
}

/// Index order: case-insensitive, by upcased characters
pub fn collate(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_uppercase)
        .cmp(b.chars().flat_map(char::to_uppercase))
}

/// A directory's filename index, ready for lookups and enumeration
pub struct DirectoryIndex {
    directory: u64,
    root: Vec<IndexEntry>,
    allocation: Option<SharedStream>,
    buffer_size: u64,
    vcn_unit: u64,
}

impl DirectoryIndex {
    /// `root_value` is the IndexRoot attribute value, `allocation` the
    /// IndexAllocation contents when the index has grown out of the record.
    pub fn new(
        directory: u64,
        root_value: &dyn ByteStream,
        allocation: Option<SharedStream>,
        cluster_size: u64,
    ) -> Result<Self> {
        let buffer_size = root_value.get_u32(0x08)? as u64;
        let root = parse_node(root_value, ROOT_NODE_HEADER)?;
        let vcn_unit = if buffer_size >= cluster_size {
            cluster_size
        } else {
            512
        };

        Ok(Self {
            directory,
            root,
            allocation,
            buffer_size,
            vcn_unit,
        })
    }

    /// Entries of the INDX buffer at `vcn`
    fn buffer(&self, vcn: u64) -> Result<Vec<IndexEntry>> {
        let Some(allocation) = &self.allocation else {
            anyhow::bail!("Index of record {} has no allocation", self.directory);
        };
        let Some(offset) = vcn.checked_mul(self.vcn_unit) else {
            anyhow::bail!("Index VCN {} of record {} is out of range", vcn, self.directory);
        };
        let window = SubStream::new(allocation.clone(), offset, self.buffer_size)?;
        if window.get_bytes(0, 4)? != INDEX_BUFFER_MAGIC {
            anyhow::bail!("No INDX signature at VCN {}", vcn);
        }

        let buffer = FixupStream::new(window.shared())?;
        if !buffer.is_intact() {
            tracing::warn!(
                "Index buffer at VCN {} of record {} failed its fixup check",
                vcn,
                self.directory
            );
        }
        parse_node(&buffer, BUFFER_NODE_HEADER)
    }

    /// Every entry in index order, skipping DOS-only aliases and the self entry
    pub fn entries(&self) -> Vec<IndexEntry> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        self.flatten(&self.root, 0, &mut visited, &mut out);
        out
    }

    fn flatten(
        &self,
        entries: &[IndexEntry],
        depth: usize,
        visited: &mut HashSet<u64>,
        out: &mut Vec<IndexEntry>,
    ) {
        for entry in entries {
            if let Some(vcn) = entry.child_vcn {
                if depth < MAX_INDEX_DEPTH && visited.insert(vcn) {
                    match self.buffer(vcn) {
                        Ok(children) => self.flatten(&children, depth + 1, visited, out),
                        Err(e) => tracing::warn!(
                            "Skipping index buffer {} of record {}: {}",
                            vcn,
                            self.directory,
                            e
                        ),
                    }
                }
            }

            let Some(key) = &entry.key else {
                continue;
            };
            if key.is_dos_only() || entry.record_number() == self.directory {
                continue;
            }
            out.push(entry.clone());
        }
    }

    /// B+ tree lookup by name
    pub fn find(&self, name: &str) -> Result<Option<IndexEntry>> {
        let mut entries = self.root.clone();
        let mut visited = HashSet::new();

        for _ in 0..MAX_INDEX_DEPTH {
            let mut descend = None;
            for entry in &entries {
                let ordering = match entry.name() {
                    Some(entry_name) if !entry.is_last() => collate(name, entry_name),
                    _ => Ordering::Less,
                };
                match ordering {
                    Ordering::Equal => return Ok(Some(entry.clone())),
                    Ordering::Less => {
                        descend = entry.child_vcn;
                        break;
                    }
                    Ordering::Greater => {}
                }
            }

            match descend {
                Some(vcn) if visited.insert(vcn) => entries = self.buffer(vcn)?,
                _ => return Ok(None),
            }
        }
        Ok(None)
    }
}
