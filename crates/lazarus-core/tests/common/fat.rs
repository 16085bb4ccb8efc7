//! FAT12/16/32 volumes with hand-placed directory entries
use super::{put_u16, put_u32};
use lazarus_core::FileSystemType;

pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const DELETED: u8 = 0xE5;

const BYTES_PER_SECTOR: usize = 512;
/// Data clusters actually present in the image; the FAT may describe more
const STORED_CLUSTERS: usize = 256;

struct Geometry {
    total_sectors: u32,
    reserved: u16,
    root_entries: u16,
    fat_sectors: u32,
}

impl Geometry {
    fn for_type(fs_type: FileSystemType) -> Self {
        match fs_type {
            FileSystemType::Fat12 => Geometry {
                total_sectors: 2880,
                reserved: 1,
                root_entries: 224,
                fat_sectors: 9,
            },
            FileSystemType::Fat16 => Geometry {
                total_sectors: 16_384,
                reserved: 1,
                root_entries: 512,
                fat_sectors: 64,
            },
            _ => Geometry {
                total_sectors: 70_000,
                reserved: 32,
                root_entries: 0,
                fat_sectors: 547,
            },
        }
    }

    fn fat_offset(&self) -> usize {
        self.reserved as usize * BYTES_PER_SECTOR
    }

    fn root_offset(&self) -> usize {
        self.fat_offset() + 2 * self.fat_sectors as usize * BYTES_PER_SECTOR
    }

    fn data_offset(&self) -> usize {
        self.root_offset() + self.root_entries as usize * 32
    }
}

/// 8.3 entry dated 2021-03-14 12:00
pub fn short_entry(name: &[u8; 11], attributes: u8, cluster: u32, size: u32) -> [u8; 32] {
    let mut entry = [0u8; 32];
    entry[..11].copy_from_slice(name);
    entry[11] = attributes;
    let time: u16 = 12 << 11;
    let date: u16 = ((2021 - 1980) << 9) | (3 << 5) | 14;
    put_u16(&mut entry, 0x0E, time);
    put_u16(&mut entry, 0x10, date);
    put_u16(&mut entry, 0x12, date);
    put_u16(&mut entry, 0x14, (cluster >> 16) as u16);
    put_u16(&mut entry, 0x16, time);
    put_u16(&mut entry, 0x18, date);
    put_u16(&mut entry, 0x1A, cluster as u16);
    put_u32(&mut entry, 0x1C, size);
    entry
}

pub fn checksum(short: &[u8; 11]) -> u8 {
    short
        .iter()
        .fold(0u8, |sum, byte| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(*byte))
}

/// Long name fragments in on-disk order, to be followed by the short entry
pub fn long_name(name: &str, short: &[u8; 11]) -> Vec<[u8; 32]> {
    let mut units: Vec<u16> = name.encode_utf16().collect();
    units.push(0);
    while units.len() % 13 != 0 {
        units.push(0xFFFF);
    }

    let sum = checksum(short);
    let count = units.len() / 13;
    let mut fragments = Vec::new();
    for (index, chunk) in units.chunks(13).enumerate() {
        let mut entry = [0u8; 32];
        entry[0] = (index + 1) as u8 | if index + 1 == count { 0x40 } else { 0 };
        entry[11] = 0x0F;
        entry[13] = sum;
        let slots = (0..5).map(|i| 1 + i * 2).chain((0..6).map(|i| 14 + i * 2)).chain((0..2).map(|i| 28 + i * 2));
        for (unit, slot) in chunk.iter().zip(slots) {
            put_u16(&mut entry, slot, *unit);
        }
        fragments.push(entry);
    }
    fragments.reverse();
    fragments
}

/// Mark every entry of a long-name set (or a lone short entry) deleted
pub fn deleted(mut entries: Vec<[u8; 32]>) -> Vec<[u8; 32]> {
    for entry in entries.iter_mut() {
        entry[0] = DELETED;
    }
    entries
}

pub struct FatImage {
    fs_type: FileSystemType,
    geometry: Geometry,
    links: Vec<(u32, u32)>,
    root: Vec<[u8; 32]>,
    contents: Vec<(u32, Vec<u8>)>,
}

impl FatImage {
    pub fn new(fs_type: FileSystemType) -> Self {
        Self {
            fs_type,
            geometry: Geometry::for_type(fs_type),
            links: Vec::new(),
            root: Vec::new(),
            contents: Vec::new(),
        }
    }

    fn end_of_chain(&self) -> u32 {
        match self.fs_type {
            FileSystemType::Fat12 => 0x0FFF,
            FileSystemType::Fat16 => 0xFFFF,
            _ => 0x0FFF_FFFF,
        }
    }

    /// Raw FAT entry for `cluster`
    pub fn set(mut self, cluster: u32, value: u32) -> Self {
        self.links.push((cluster, value));
        self
    }

    /// Link `clusters` into one chain ending in an end-of-chain marker
    pub fn chain(mut self, clusters: &[u32]) -> Self {
        for pair in clusters.windows(2) {
            self.links.push((pair[0], pair[1]));
        }
        if let Some(last) = clusters.last() {
            let end = self.end_of_chain();
            self.links.push((*last, end));
        }
        self
    }

    pub fn root_entries(mut self, entries: impl IntoIterator<Item = [u8; 32]>) -> Self {
        self.root.extend(entries);
        self
    }

    /// Write `bytes` starting at data cluster `cluster`
    pub fn write(mut self, cluster: u32, bytes: Vec<u8>) -> Self {
        self.contents.push((cluster, bytes));
        self
    }

    /// Directory cluster holding `entries`
    pub fn directory(self, cluster: u32, entries: impl IntoIterator<Item = [u8; 32]>) -> Self {
        let bytes = entries.into_iter().flatten().collect();
        self.write(cluster, bytes)
    }

    pub fn build(self) -> Vec<u8> {
        let fat32 = self.fs_type == FileSystemType::Fat32;
        let g = &self.geometry;
        let mut image = vec![0u8; g.data_offset() + STORED_CLUSTERS * BYTES_PER_SECTOR];
        image[..512].copy_from_slice(&self.boot_sector());

        let mut links = vec![(0, 0x0FFF_FFF8 & self.end_of_chain()), (1, self.end_of_chain())];
        if fat32 {
            // Root directory in cluster 2
            links.push((2, self.end_of_chain()));
        }
        links.extend(self.links.iter().copied());

        for copy in 0..2 {
            let fat = g.fat_offset() + copy * g.fat_sectors as usize * BYTES_PER_SECTOR;
            for (cluster, value) in &links {
                self.put_fat(&mut image[fat..], *cluster, *value);
            }
        }

        let root_offset = if fat32 { g.data_offset() } else { g.root_offset() };
        for (i, entry) in self.root.iter().enumerate() {
            let at = root_offset + i * 32;
            image[at..at + 32].copy_from_slice(entry);
        }

        for (cluster, bytes) in &self.contents {
            let at = g.data_offset() + (*cluster as usize - 2) * BYTES_PER_SECTOR;
            image[at..at + bytes.len()].copy_from_slice(bytes);
        }
        image
    }

    fn put_fat(&self, fat: &mut [u8], cluster: u32, value: u32) {
        let n = cluster as usize;
        match self.fs_type {
            FileSystemType::Fat12 => {
                let at = n + n / 2;
                let value = (value & 0x0FFF) as u16;
                let current = u16::from_le_bytes([fat[at], fat[at + 1]]);
                let packed = if n % 2 == 0 {
                    (current & 0xF000) | value
                } else {
                    (current & 0x000F) | (value << 4)
                };
                put_u16(fat, at, packed);
            }
            FileSystemType::Fat16 => put_u16(fat, n * 2, value as u16),
            _ => put_u32(fat, n * 4, value & 0x0FFF_FFFF),
        }
    }

    fn boot_sector(&self) -> Vec<u8> {
        let g = &self.geometry;
        let mut sector = vec![0u8; 512];
        sector[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        sector[3..11].copy_from_slice(b"MSWIN4.1");
        put_u16(&mut sector, 0x0B, BYTES_PER_SECTOR as u16);
        sector[0x0D] = 1;
        put_u16(&mut sector, 0x0E, g.reserved);
        sector[0x10] = 2;
        put_u16(&mut sector, 0x11, g.root_entries);
        sector[0x15] = 0xF8;

        if self.fs_type == FileSystemType::Fat32 {
            put_u32(&mut sector, 0x20, g.total_sectors);
            put_u32(&mut sector, 0x24, g.fat_sectors);
            put_u32(&mut sector, 0x2C, 2);
            sector[0x42] = 0x29;
            put_u32(&mut sector, 0x43, 0xCAFE_F00D);
            sector[0x47..0x52].copy_from_slice(b"LAZARUS32  ");
            sector[0x52..0x5A].copy_from_slice(b"FAT32   ");
        } else {
            put_u16(&mut sector, 0x13, g.total_sectors as u16);
            put_u16(&mut sector, 0x16, g.fat_sectors as u16);
            sector[0x26] = 0x29;
            put_u32(&mut sector, 0x27, 0x1234_5678);
            sector[0x2B..0x36].copy_from_slice(b"LAZARUS    ");
        }
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }
}

/// Prefix `volume` with a master boot record holding it as partition 1
pub fn with_mbr(volume: Vec<u8>, partition_type: u8, start_sector: u32) -> Vec<u8> {
    let start = start_sector as usize * BYTES_PER_SECTOR;
    let mut disk = vec![0u8; start + volume.len()];
    let entry = 0x1BE;
    disk[entry + 4] = partition_type;
    put_u32(&mut disk, entry + 8, start_sector);
    put_u32(&mut disk, entry + 12, (volume.len() / BYTES_PER_SECTOR) as u32);
    disk[510] = 0x55;
    disk[511] = 0xAA;
    disk[start..].copy_from_slice(&volume);
    disk
}
