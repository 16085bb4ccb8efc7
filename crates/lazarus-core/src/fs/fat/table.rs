//! File Allocation Table parsing and chain traversal
//!
//! Entry values, by width:
//! - 0: free cluster
//! - 1: reserved
//! - 2..=max cluster: next cluster in chain
//! - 0xFF7 / 0xFFF7 / 0x0FFFFFF7: bad cluster
//! - 0xFF8.. / 0xFFF8.. / 0x0FFFFFF8..: end of chain
//!
//! FAT32 entries only use their low 28 bits.

use std::collections::HashSet;

use super::boot::{BiosParameterBlock, FatType};
use crate::stream::{check_range, ByteStream, SharedStream, StreamResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    Next(u32),
    Bad,
    EndOfChain,
    /// Reserved values and pointers outside the volume
    Invalid(u32),
}

/// Why a chain walk stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEnd {
    EndOfChain,
    /// Ran into a free, bad or invalid entry
    Broken,
    Loop,
    LimitReached,
    ReadError,
}

#[derive(Debug, Clone)]
pub struct ClusterChain {
    pub clusters: Vec<u32>,
    pub end: ChainEnd,
}

/// The first FAT copy of a volume, read through the volume stream
#[derive(Debug, Clone)]
pub struct FatTable {
    volume: SharedStream,
    fat_type: FatType,
    offset: u64,
    size: u64,
    cluster_count: u32,
    max_chain: u32,
}

impl FatTable {
    pub fn new(volume: SharedStream, bpb: &BiosParameterBlock, max_chain_length: u32) -> Self {
        let cluster_count = bpb.cluster_count();
        Self {
            volume,
            fat_type: bpb.fat_type,
            offset: bpb.fat_offset(),
            size: bpb.fat_size as u64 * bpb.bytes_per_sector as u64,
            cluster_count,
            max_chain: max_chain_length.min(cluster_count),
        }
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    /// Highest valid cluster number
    pub fn max_cluster(&self) -> u32 {
        self.cluster_count + 1
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster <= self.max_cluster()
    }

    /// Raw entry value for `cluster`
    pub fn raw_entry(&self, cluster: u32) -> StreamResult<u32> {
        let cluster = cluster as u64;
        let (start, width) = match self.fat_type {
            FatType::Fat12 => (cluster + cluster / 2, 2),
            FatType::Fat16 => (cluster * 2, 2),
            FatType::Fat32 => (cluster * 4, 4),
        };
        check_range(self.size, start, width)?;

        let pos = self.offset + start;
        match self.fat_type {
            FatType::Fat12 => {
                let pair = self.volume.get_u16(pos)?;
                Ok(if cluster & 1 == 1 {
                    (pair >> 4) as u32
                } else {
                    (pair & 0x0FFF) as u32
                })
            }
            FatType::Fat16 => Ok(self.volume.get_u16(pos)? as u32),
            FatType::Fat32 => Ok(self.volume.get_u32(pos)? & 0x0FFF_FFFF),
        }
    }

    pub fn entry(&self, cluster: u32) -> StreamResult<FatEntry> {
        let value = self.raw_entry(cluster)?;
        Ok(if value == 0 {
            FatEntry::Free
        } else if value >= self.fat_type.end_of_chain() {
            FatEntry::EndOfChain
        } else if value == self.fat_type.bad_cluster() {
            FatEntry::Bad
        } else if self.is_valid_cluster(value) {
            FatEntry::Next(value)
        } else {
            FatEntry::Invalid(value)
        })
    }

    /// Next cluster of a chain, `None` once the chain terminates
    pub fn get_next_cluster(&self, cluster: u32) -> Option<u32> {
        if !self.is_valid_cluster(cluster) {
            return None;
        }
        match self.entry(cluster) {
            Ok(FatEntry::Next(next)) => Some(next),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("FAT entry {} unreadable: {}", cluster, e);
                None
            }
        }
    }

    /// Follow a chain from `start`, stopping on loops and at the length limit
    pub fn chain(&self, start: u32) -> ClusterChain {
        let mut clusters = Vec::new();
        let mut visited = HashSet::new();
        let mut current = start;

        let end = loop {
            if !self.is_valid_cluster(current) {
                break ChainEnd::Broken;
            }
            if clusters.len() as u32 >= self.max_chain {
                tracing::warn!("FAT chain from cluster {} hit the length limit", start);
                break ChainEnd::LimitReached;
            }
            if !visited.insert(current) {
                tracing::warn!("FAT chain loop detected at cluster {}", current);
                break ChainEnd::Loop;
            }
            clusters.push(current);

            match self.entry(current) {
                Ok(FatEntry::Next(next)) => current = next,
                Ok(FatEntry::EndOfChain) => break ChainEnd::EndOfChain,
                Ok(_) => break ChainEnd::Broken,
                Err(e) => {
                    tracing::debug!("FAT entry {} unreadable: {}", current, e);
                    break ChainEnd::ReadError;
                }
            }
        };

        ClusterChain { clusters, end }
    }

    pub fn is_free(&self, cluster: u32) -> bool {
        self.is_valid_cluster(cluster) && matches!(self.entry(cluster), Ok(FatEntry::Free))
    }

    pub fn free_cluster_count(&self) -> u32 {
        (2..=self.max_cluster())
            .filter(|cluster| self.is_free(*cluster))
            .count() as u32
    }

    /// Size of one FAT copy in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}
