//! Splitting a disk into volumes
//!
//! A disk either starts with a boot sector of its own (a "superfloppy"
//! formatted without a partition table) or with an MBR whose four primary
//! entries point at the volumes. Protective GPT MBRs are treated as a
//! whole-disk volume.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::sync::Arc;

use super::{fat, ntfs};
use crate::stream::{ByteStream, SectorStream, SharedStream, SubStream};

pub const SECTOR_SIZE: u64 = 512;
const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const PARTITION_ENTRY_SIZE: usize = 16;

pub const PARTITION_TYPE_EMPTY: u8 = 0x00;
pub const PARTITION_TYPE_GPT_PROTECTIVE: u8 = 0xEE;
const EXTENDED_TYPES: [u8; 3] = [0x05, 0x0F, 0x85];

/// One primary MBR partition entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub index: usize,
    pub bootable: bool,
    pub partition_type: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

impl PartitionEntry {
    pub fn is_extended(&self) -> bool {
        EXTENDED_TYPES.contains(&self.partition_type)
    }
}

/// Decode the four primary entries; empty slots are skipped
pub fn parse_partition_table(sector: &[u8]) -> Result<Vec<PartitionEntry>> {
    if sector.len() < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
        anyhow::bail!("Sector 0 has no boot signature");
    }

    let mut entries = Vec::new();
    for index in 0..4 {
        let start = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_SIZE;
        let mut cursor = Cursor::new(&sector[start..start + PARTITION_ENTRY_SIZE]);
        let status = cursor.read_u8()?;
        cursor.set_position(4);
        let partition_type = cursor.read_u8()?;
        cursor.set_position(8);
        let start_lba = cursor.read_u32::<LittleEndian>()?;
        let sector_count = cursor.read_u32::<LittleEndian>()?;

        if partition_type == PARTITION_TYPE_EMPTY || sector_count == 0 {
            continue;
        }
        entries.push(PartitionEntry {
            index,
            bootable: status == 0x80,
            partition_type,
            start_lba,
            sector_count,
        });
    }
    Ok(entries)
}

/// A candidate volume on a disk
#[derive(Debug, Clone)]
pub struct Volume {
    /// `disk0` for a whole disk, `disk0p1` for its first partition
    pub label: String,
    pub stream: SharedStream,
    pub partition_type: Option<u8>,
}

/// Volumes of a disk, in partition table order
pub fn volumes_for_disk(disk: SharedStream, label: &str) -> Result<Vec<Volume>> {
    let mbr = SectorStream::new(disk.clone(), 0, SECTOR_SIZE, "MBR")
        .with_context(|| format!("{}: disk is smaller than one sector", label))?;
    let sector = mbr.get_bytes(0, SECTOR_SIZE as usize)?;

    let whole_disk = || Volume {
        label: label.to_string(),
        stream: disk.clone(),
        partition_type: None,
    };

    if ntfs::is_ntfs_boot_sector(&sector) || fat::is_fat_boot_sector(&sector) {
        tracing::debug!("{}: no partition table, boot sector at LBA 0", label);
        return Ok(vec![whole_disk()]);
    }
    if !mbr.has_boot_signature() {
        tracing::debug!("{}: no MBR signature, treating as a single volume", label);
        return Ok(vec![whole_disk()]);
    }

    let entries = parse_partition_table(&sector)?;
    if entries
        .iter()
        .any(|entry| entry.partition_type == PARTITION_TYPE_GPT_PROTECTIVE)
    {
        tracing::info!("{}: GPT disks are read as a single volume", label);
        return Ok(vec![whole_disk()]);
    }

    let mut volumes = Vec::new();
    for entry in entries {
        let volume_label = format!("{}p{}", label, entry.index + 1);
        if entry.is_extended() {
            tracing::debug!("{}: skipping extended partition", volume_label);
            continue;
        }

        let start = entry.start_lba as u64 * SECTOR_SIZE;
        let length = entry.sector_count as u64 * SECTOR_SIZE;
        match SubStream::clamped(disk.clone(), start, length) {
            Ok(stream) if stream.length() > 0 => {
                if stream.length() < length {
                    tracing::warn!("{}: partition extends past the end of the disk", volume_label);
                }
                volumes.push(Volume {
                    label: volume_label,
                    stream: Arc::new(stream),
                    partition_type: Some(entry.partition_type),
                });
            }
            _ => tracing::warn!("{}: partition starts past the end of the disk", volume_label),
        }
    }

    if volumes.is_empty() {
        return Ok(vec![whole_disk()]);
    }
    Ok(volumes)
}
