/// FAT BIOS parameter block
use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read};

use crate::FileSystemType;

/// Cluster-count thresholds that decide the FAT width
pub const FAT12_MAX_CLUSTERS: u32 = 4085;
pub const FAT16_MAX_CLUSTERS: u32 = 65525;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn from_cluster_count(clusters: u32) -> Self {
        if clusters < FAT12_MAX_CLUSTERS {
            FatType::Fat12
        } else if clusters < FAT16_MAX_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// Smallest entry value meaning end of chain
    pub fn end_of_chain(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    pub fn bad_cluster(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFF_FFF7,
        }
    }
}

impl From<FatType> for FileSystemType {
    fn from(fat_type: FatType) -> Self {
        match fat_type {
            FatType::Fat12 => FileSystemType::Fat12,
            FatType::Fat16 => FileSystemType::Fat16,
            FatType::Fat32 => FileSystemType::Fat32,
        }
    }
}

impl fmt::Display for FatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", FileSystemType::from(*self))
    }
}

/// Cheap structural check on a candidate boot sector
pub fn is_fat_boot_sector(sector: &[u8]) -> bool {
    if sector.len() < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
        return false;
    }
    if !matches!(sector[0], 0xEB | 0xE9) {
        return false;
    }
    let bytes_per_sector = u16::from_le_bytes([sector[0x0B], sector[0x0C]]);
    let sectors_per_cluster = sector[0x0D];
    let reserved = u16::from_le_bytes([sector[0x0E], sector[0x0F]]);
    let fats = sector[0x10];

    matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096)
        && sectors_per_cluster != 0
        && sectors_per_cluster.is_power_of_two()
        && reserved != 0
        && (1..=2).contains(&fats)
}

#[derive(Debug, Clone)]
pub struct BiosParameterBlock {
    pub oem_name: String,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub root_entry_count: u16,
    pub total_sectors: u32,
    pub media: u8,
    /// Sectors per FAT copy
    pub fat_size: u32,
    pub hidden_sectors: u32,
    /// First cluster of the root directory (FAT32 only)
    pub root_cluster: u32,
    pub volume_id: u32,
    pub volume_label: String,
    pub fat_type: FatType,
}

impl BiosParameterBlock {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !is_fat_boot_sector(data) {
            anyhow::bail!("Not a FAT boot sector");
        }

        let mut cursor = Cursor::new(data);
        cursor.set_position(3);
        let mut oem = [0u8; 8];
        cursor.read_exact(&mut oem)?;

        let bytes_per_sector = cursor.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = cursor.read_u8()?;
        let reserved_sectors = cursor.read_u16::<LittleEndian>()?;
        let fat_count = cursor.read_u8()?;
        let root_entry_count = cursor.read_u16::<LittleEndian>()?;
        let total_sectors_16 = cursor.read_u16::<LittleEndian>()?;
        let media = cursor.read_u8()?;
        let fat_size_16 = cursor.read_u16::<LittleEndian>()?;
        let _sectors_per_track = cursor.read_u16::<LittleEndian>()?;
        let _heads = cursor.read_u16::<LittleEndian>()?;
        let hidden_sectors = cursor.read_u32::<LittleEndian>()?;
        let total_sectors_32 = cursor.read_u32::<LittleEndian>()?;

        // FAT32 extended fields start at 0x24; FAT12/16 put the label block there
        let fat_size_32 = cursor.read_u32::<LittleEndian>()?;
        cursor.set_position(0x2C);
        let root_cluster_32 = cursor.read_u32::<LittleEndian>()?;

        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16 as u32
        } else {
            total_sectors_32
        };
        let fat_size = if fat_size_16 != 0 {
            fat_size_16 as u32
        } else {
            fat_size_32
        };
        if total_sectors == 0 || fat_size == 0 {
            anyhow::bail!("FAT boot sector declares an empty volume or FAT");
        }

        let root_dir_sectors = (root_entry_count as u32 * 32).div_ceil(bytes_per_sector as u32);
        let meta_sectors = reserved_sectors as u64
            + fat_count as u64 * fat_size as u64
            + root_dir_sectors as u64;
        if meta_sectors >= total_sectors as u64 {
            anyhow::bail!("FAT metadata ({} sectors) fills the whole volume", meta_sectors);
        }
        let cluster_count = (total_sectors - meta_sectors as u32) / sectors_per_cluster as u32;
        let fat_type = FatType::from_cluster_count(cluster_count);

        let (volume_id, label_offset, root_cluster) = match fat_type {
            FatType::Fat32 => (
                u32::from_le_bytes([data[0x43], data[0x44], data[0x45], data[0x46]]),
                0x47,
                root_cluster_32,
            ),
            _ => (
                u32::from_le_bytes([data[0x27], data[0x28], data[0x29], data[0x2A]]),
                0x2B,
                0,
            ),
        };
        if fat_type == FatType::Fat32 && (root_entry_count != 0 || root_cluster < 2) {
            anyhow::bail!("Inconsistent FAT32 root directory fields");
        }
        if fat_type != FatType::Fat32 && root_entry_count == 0 {
            anyhow::bail!("FAT12/16 volume without a root directory region");
        }

        let volume_label = String::from_utf8_lossy(&data[label_offset..label_offset + 11])
            .trim_end()
            .to_string();

        Ok(BiosParameterBlock {
            oem_name: String::from_utf8_lossy(&oem).trim_end().to_string(),
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            root_entry_count,
            total_sectors,
            media,
            fat_size,
            hidden_sectors,
            root_cluster,
            volume_id,
            volume_label,
            fat_type,
        })
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn fat_offset(&self) -> u64 {
        self.reserved_sectors as u64 * self.bytes_per_sector as u64
    }

    /// Byte offset of the fixed FAT12/16 root directory
    pub fn root_dir_offset(&self) -> u64 {
        self.fat_offset() + self.fat_count as u64 * self.fat_size as u64 * self.bytes_per_sector as u64
    }

    pub fn root_dir_size(&self) -> u64 {
        self.root_entry_count as u64 * 32
    }

    fn root_dir_sectors(&self) -> u64 {
        self.root_dir_size().div_ceil(self.bytes_per_sector as u64)
    }

    /// Byte offset of cluster 2
    pub fn data_offset(&self) -> u64 {
        self.root_dir_offset() + self.root_dir_sectors() * self.bytes_per_sector as u64
    }

    pub fn cluster_count(&self) -> u32 {
        let data_sectors = self.total_sectors as u64 - self.data_offset() / self.bytes_per_sector as u64;
        (data_sectors / self.sectors_per_cluster as u64) as u32
    }
}
